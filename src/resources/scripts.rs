//! Shell programs run by the generated jobs
//!
//! Both scripts run under `bash -ceu`, so any failing step aborts the job
//! with a non-zero exit code and leaves the data directories as they were
//! at the point of failure. Versions arrive as positional arguments.

/// Interpreter prefix shared by every generated job command
pub const INTERPRETER: [&str; 3] = ["bash", "-ceu", "--"];

/// First positional argument of the upgrade job
pub const ARG_UPGRADE: &str = "upgrade";

/// First positional argument of the data removal job
pub const ARG_REMOVE: &str = "remove";

/// Upgrades `/pgdata/pg<old>` into `/pgdata/pg<new>` with `pg_upgrade --link`.
///
/// Arguments: `$1` old major version, `$2` new major version.
///
/// The last step exits non-zero unless `pg_controldata` reports the new data
/// directory as "shut down", so a completed job means the destination
/// directory exists and is clean.
///
/// The container user is arbitrary, so an nss_wrapper passwd/group pair maps
/// it to `postgres` before any PostgreSQL binary runs.
pub const UPGRADE_SCRIPT: &str = r#"declare -r data_volume='/pgdata' old_version="$1" new_version="$2"
printf 'Performing PostgreSQL upgrade from version "%s" to "%s" ...\n\n' "$@"
gid=$(id -G); NSS_WRAPPER_GROUP=$(mktemp)
(sed "/^postgres:x:/ d; /^[^:]*:x:${gid%% *}:/ d" /etc/group
echo "postgres:x:${gid%% *}:") > "${NSS_WRAPPER_GROUP}"
uid=$(id -u); NSS_WRAPPER_PASSWD=$(mktemp)
(sed "/^postgres:x:/ d; /^[^:]*:x:${uid}:/ d" /etc/passwd
echo "postgres:x:${uid}:${gid%% *}::${data_volume}:") > "${NSS_WRAPPER_PASSWD}"
export LD_PRELOAD='libnss_wrapper.so' NSS_WRAPPER_GROUP NSS_WRAPPER_PASSWD
cd /pgdata || exit
echo -e "Step 1: Making new pgdata directory...\n"
mkdir /pgdata/pg"${new_version}"
echo -e "Step 2: Initializing new pgdata directory...\n"
/usr/pgsql-"${new_version}"/bin/initdb -k -D /pgdata/pg"${new_version}"
echo -e "\nStep 3: Setting the expected permissions on the old pgdata directory...\n"
chmod 700 /pgdata/pg"${old_version}"
echo -e "Step 4: Copying shared_preload_libraries setting to new postgresql.conf file...\n"
echo "shared_preload_libraries = '$(/usr/pgsql-"""${old_version}"""/bin/postgres -D \
/pgdata/pg"""${old_version}""" -C shared_preload_libraries)'" >> /pgdata/pg"${new_version}"/postgresql.conf
echo -e "Step 5: Running pg_upgrade check...\n"
time /usr/pgsql-"${new_version}"/bin/pg_upgrade --old-bindir /usr/pgsql-"${old_version}"/bin \
--new-bindir /usr/pgsql-"${new_version}"/bin --old-datadir /pgdata/pg"${old_version}"\
 --new-datadir /pgdata/pg"${new_version}" --link --check
echo -e "\nStep 6: Running pg_upgrade...\n"
time /usr/pgsql-"${new_version}"/bin/pg_upgrade --old-bindir /usr/pgsql-"${old_version}"/bin \
--new-bindir /usr/pgsql-"${new_version}"/bin --old-datadir /pgdata/pg"${old_version}" \
--new-datadir /pgdata/pg"${new_version}" --link
echo -e "\nStep 7: Copying patroni.dynamic.json...\n"
cp /pgdata/pg"${old_version}"/patroni.dynamic.json /pgdata/pg"${new_version}"
echo -e "\nStep 8: Checking the new pgdata directory was shut down cleanly...\n"
if [ "$(/usr/pgsql-"${new_version}"/bin/pg_controldata /pgdata/pg"${new_version}" | grep -c "^Database cluster state: *shut down$")" -ne 1 ]; then echo -e "New pgdata directory is not cleanly shut down..."; exit 1; fi
echo -e "\npg_upgrade Job Complete!""#;

/// Removes `/pgdata/pg<old>` and the directory its `pg_wal` link points at.
///
/// Arguments: `$1` old major version.
///
/// Refuses to delete anything unless `pg_controldata` reports the cluster as
/// "shut down in recovery".
pub const REMOVE_DATA_SCRIPT: &str = r#"declare -r old_version="$1"
printf 'Removing PostgreSQL data dir for pg%s...\n\n' "$@"
echo -e "Checking the directory exists and isn't being used...\n"
cd /pgdata || exit
if [ "$(/usr/pgsql-"${old_version}"/bin/pg_controldata /pgdata/pg"${old_version}" | grep -c "shut down in recovery")" -ne 1 ]; then echo -e "Directory in use, cannot remove..."; exit 1; fi
echo -e "Removing old pgdata directory...\n"
rm -rf /pgdata/pg"${old_version}" "$(realpath /pgdata/pg${old_version}/pg_wal)"
echo -e "Remove Data Job Complete!""#;

/// Build a job command: interpreter, script, then positional arguments
pub fn command(script: &str, args: &[String]) -> Vec<String> {
    INTERPRETER
        .iter()
        .map(|s| s.to_string())
        .chain(std::iter::once(script.to_string()))
        .chain(args.iter().cloned())
        .collect()
}
