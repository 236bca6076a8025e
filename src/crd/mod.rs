mod pg_upgrade;

pub use pg_upgrade::*;
