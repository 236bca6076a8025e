pub mod common;
pub mod jobs;
pub mod quantity;
pub mod scripts;

pub use common::{API_VERSION, FIELD_MANAGER, KIND, owner_reference, upgrade_labels};
pub use jobs::{
    generate_remove_data_job, generate_upgrade_job, remove_data_job_name, upgrade_job_name,
};
pub use quantity::{QuantityError, canonical_quantity};
