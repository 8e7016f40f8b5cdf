// ============================================================================
// BUILT-IN TABLES
// ============================================================================
// Column tables and version-ranged queries for the standard statistics views.
// Both statics are process-wide and immutable.
// ============================================================================

use std::collections::BTreeMap;

use once_cell::sync::Lazy;

use super::{ColumnMapping, ColumnUsage, MappingTable, NamespaceMapping};
use crate::overrides::{OverrideQuery, OverrideTable};
use crate::version::{Comparator, Op, Version, VersionRange};

use super::ColumnUsage::{Counter, Discard, Gauge, Label};

const V9_2: Version = Version::new(9, 2, 0);
const V9_4: Version = Version::new(9, 4, 0);
const V10: Version = Version::new(10, 0, 0);

fn col(usage: ColumnUsage, description: &str) -> ColumnMapping {
    ColumnMapping::new(usage, description)
}

fn namespace(columns: Vec<(&str, ColumnMapping)>) -> NamespaceMapping {
    NamespaceMapping {
        columns: columns
            .into_iter()
            .map(|(name, mapping)| (name.to_string(), mapping))
            .collect::<BTreeMap<_, _>>(),
        master_only: true,
        cache_seconds: 0,
    }
}

fn any_release() -> VersionRange {
    VersionRange::from_comparators(vec![Comparator::new(Op::Gt, Version::new(0, 0, 0))])
}

// ----------------------------------------------------------------------------
// Column Tables
// ----------------------------------------------------------------------------

pub static BUILTIN_METRIC_MAPS: Lazy<MappingTable> = Lazy::new(|| {
    let mut maps = MappingTable::new();

    maps.insert(
        "pg_stat_bgwriter".into(),
        namespace(vec![
            ("checkpoints_timed", col(Counter, "Number of scheduled checkpoints that have been performed")),
            ("checkpoints_req", col(Counter, "Number of requested checkpoints that have been performed")),
            (
                "checkpoint_write_time",
                col(
                    Counter,
                    "Total amount of time that has been spent in the portion of checkpoint processing where files are written to disk, in milliseconds",
                ),
            ),
            (
                "checkpoint_sync_time",
                col(
                    Counter,
                    "Total amount of time that has been spent in the portion of checkpoint processing where files are synchronized to disk, in milliseconds",
                ),
            ),
            ("buffers_checkpoint", col(Counter, "Number of buffers written during checkpoints")),
            ("buffers_clean", col(Counter, "Number of buffers written by the background writer")),
            (
                "maxwritten_clean",
                col(
                    Counter,
                    "Number of times the background writer stopped a cleaning scan because it had written too many buffers",
                ),
            ),
            ("buffers_backend", col(Counter, "Number of buffers written directly by a backend")),
            (
                "buffers_backend_fsync",
                col(
                    Counter,
                    "Number of times a backend had to execute its own fsync call (normally the background writer handles those even when the backend does its own write)",
                ),
            ),
            ("buffers_alloc", col(Counter, "Number of buffers allocated")),
            ("stats_reset", col(Counter, "Time at which these statistics were last reset")),
        ]),
    );

    maps.insert(
        "pg_stat_database".into(),
        namespace(vec![
            ("datid", col(Label, "OID of a database")),
            ("datname", col(Label, "Name of this database")),
            (
                "numbackends",
                col(
                    Gauge,
                    "Number of backends currently connected to this database. This is the only column in this view that returns a value reflecting current state; all other columns return the accumulated values since the last reset.",
                ),
            ),
            ("xact_commit", col(Counter, "Number of transactions in this database that have been committed")),
            ("xact_rollback", col(Counter, "Number of transactions in this database that have been rolled back")),
            ("blks_read", col(Counter, "Number of disk blocks read in this database")),
            (
                "blks_hit",
                col(
                    Counter,
                    "Number of times disk blocks were found already in the buffer cache, so that a read was not necessary (this only includes hits in the PostgreSQL buffer cache, not the operating system's file system cache)",
                ),
            ),
            ("tup_returned", col(Counter, "Number of rows returned by queries in this database")),
            ("tup_fetched", col(Counter, "Number of rows fetched by queries in this database")),
            ("tup_inserted", col(Counter, "Number of rows inserted by queries in this database")),
            ("tup_updated", col(Counter, "Number of rows updated by queries in this database")),
            ("tup_deleted", col(Counter, "Number of rows deleted by queries in this database")),
            (
                "conflicts",
                col(
                    Counter,
                    "Number of queries canceled due to conflicts with recovery in this database. (Conflicts occur only on standby servers; see pg_stat_database_conflicts for details.)",
                ),
            ),
            (
                "temp_files",
                col(
                    Counter,
                    "Number of temporary files created by queries in this database. All temporary files are counted, regardless of why the temporary file was created (e.g., sorting or hashing), and regardless of the log_temp_files setting.",
                ),
            ),
            (
                "temp_bytes",
                col(
                    Counter,
                    "Total amount of data written to temporary files by queries in this database. All temporary files are counted, regardless of why the temporary file was created, and regardless of the log_temp_files setting.",
                ),
            ),
            ("deadlocks", col(Counter, "Number of deadlocks detected in this database")),
            (
                "blk_read_time",
                col(Counter, "Time spent reading data file blocks by backends in this database, in milliseconds"),
            ),
            (
                "blk_write_time",
                col(Counter, "Time spent writing data file blocks by backends in this database, in milliseconds"),
            ),
            ("stats_reset", col(Counter, "Time at which these statistics were last reset")),
        ]),
    );

    maps.insert(
        "pg_stat_database_conflicts".into(),
        namespace(vec![
            ("datid", col(Label, "OID of a database")),
            ("datname", col(Label, "Name of this database")),
            (
                "confl_tablespace",
                col(Counter, "Number of queries in this database that have been canceled due to dropped tablespaces"),
            ),
            (
                "confl_lock",
                col(Counter, "Number of queries in this database that have been canceled due to lock timeouts"),
            ),
            (
                "confl_snapshot",
                col(Counter, "Number of queries in this database that have been canceled due to old snapshots"),
            ),
            (
                "confl_bufferpin",
                col(Counter, "Number of queries in this database that have been canceled due to pinned buffers"),
            ),
            (
                "confl_deadlock",
                col(Counter, "Number of queries in this database that have been canceled due to deadlocks"),
            ),
        ]),
    );

    maps.insert(
        "pg_locks".into(),
        namespace(vec![
            ("datname", col(Label, "Name of this database")),
            ("mode", col(Label, "Type of Lockmode")),
            ("count", col(Gauge, "Number of locks")),
        ]),
    );

    maps.insert(
        "pg_stat_replication".into(),
        namespace(vec![
            (
                "procpid",
                col(Label, "Process ID of a WAL sender process").versions(VersionRange::below(V9_2)),
            ),
            (
                "pid",
                col(Label, "Process ID of a WAL sender process").versions(VersionRange::at_least(V9_2)),
            ),
            ("usesysid", col(Discard, "OID of the user logged into this WAL sender process")),
            ("usename", col(Discard, "Name of the user logged into this WAL sender process")),
            ("application_name", col(Label, "Name of the application that is connected to this WAL sender")),
            (
                "client_addr",
                col(
                    Label,
                    "IP address of the client connected to this WAL sender. If this field is null, it indicates that the client is connected via a Unix socket on the server machine.",
                ),
            ),
            ("client_hostname", col(Discard, "Host name of the connected client, as reported by a reverse DNS lookup of client_addr")),
            ("client_port", col(Discard, "TCP port number that the client is using for communication with this WAL sender, or -1 if a Unix socket is used")),
            ("backend_start", col(Discard, "Time when this process was started, i.e., when the client connected to this WAL sender")),
            ("backend_xmin", col(Discard, "The current backend's xmin horizon.")),
            ("state", col(Label, "Current WAL sender state")),
            (
                "slot_name",
                col(Label, "A unique, cluster-wide identifier for the replication slot")
                    .versions(VersionRange::at_least(V9_2)),
            ),
            ("sync_priority", col(Discard, "Priority of this standby server for being chosen as the synchronous standby")),
            ("sync_state", col(Label, "Synchronous state of this standby server")),
            (
                "sent_location",
                col(Discard, "Last transaction log position sent on this connection").versions(VersionRange::below(V10)),
            ),
            (
                "write_location",
                col(Discard, "Last transaction log position written to disk by this standby server")
                    .versions(VersionRange::below(V10)),
            ),
            (
                "flush_location",
                col(Discard, "Last transaction log position flushed to disk by this standby server")
                    .versions(VersionRange::below(V10)),
            ),
            (
                "replay_location",
                col(Discard, "Last transaction log position replayed into the database on this standby server")
                    .versions(VersionRange::below(V10)),
            ),
            (
                "sent_lsn",
                col(Discard, "Last write-ahead log location sent on this connection").versions(VersionRange::at_least(V10)),
            ),
            (
                "write_lsn",
                col(Discard, "Last write-ahead log location written to disk by this standby server")
                    .versions(VersionRange::at_least(V10)),
            ),
            (
                "flush_lsn",
                col(Discard, "Last write-ahead log location flushed to disk by this standby server")
                    .versions(VersionRange::at_least(V10)),
            ),
            (
                "replay_lsn",
                col(Discard, "Last write-ahead log location replayed into the database on this standby server")
                    .versions(VersionRange::at_least(V10)),
            ),
            ("write_lag", col(Discard, "Time elapsed between flushing recent WAL locally and receiving notification that this standby server has written it")),
            ("flush_lag", col(Discard, "Time elapsed between flushing recent WAL locally and receiving notification that this standby server has written and flushed it")),
            ("replay_lag", col(Discard, "Time elapsed between flushing recent WAL locally and receiving notification that this standby server has written, flushed and applied it")),
            ("pg_current_xlog_location", col(Discard, "pg_current_xlog_location provides the current transaction log write location")),
            (
                "pg_current_wal_lsn",
                col(Discard, "pg_current_wal_lsn provides the current write-ahead log write location")
                    .versions(VersionRange::at_least(V10)),
            ),
            (
                "pg_current_wal_lsn_bytes",
                col(Gauge, "WAL position in bytes").versions(VersionRange::at_least(V10)),
            ),
            (
                "pg_xlog_location_diff",
                col(Gauge, "Lag in bytes between master and slave").versions(VersionRange::between(V9_2, V10)),
            ),
            (
                "pg_wal_lsn_diff",
                col(Gauge, "Lag in bytes between master and slave").versions(VersionRange::at_least(V10)),
            ),
        ]),
    );

    maps.insert(
        "pg_replication_slots".into(),
        namespace(vec![
            ("slot_name", col(Label, "Name of the replication slot")),
            ("database", col(Label, "Name of the database")),
            ("active", col(Gauge, "Flag indicating if the slot is active")),
            ("pg_wal_lsn_diff", col(Gauge, "Replication lag in bytes")),
        ]),
    );

    maps.insert(
        "pg_stat_archiver".into(),
        namespace(vec![
            ("archived_count", col(Counter, "Number of WAL files that have been successfully archived")),
            ("last_archived_wal", col(Discard, "Name of the last WAL file successfully archived")),
            ("last_archived_time", col(Discard, "Time of the last successful archive operation")),
            ("failed_count", col(Counter, "Number of failed attempts for archiving WAL files")),
            ("last_failed_wal", col(Discard, "Name of the WAL file of the last failed archival operation")),
            ("last_failed_time", col(Discard, "Time of the last failed archival operation")),
            ("stats_reset", col(Discard, "Time at which these statistics were last reset")),
            (
                "last_archive_age",
                col(Gauge, "Time in seconds since last WAL segment was successfully archived"),
            ),
        ]),
    );

    maps.insert(
        "pg_stat_activity".into(),
        namespace(vec![
            ("datname", col(Label, "Name of this database")),
            ("state", col(Label, "connection state")),
            ("usename", col(Label, "connection usename")),
            ("application_name", col(Label, "connection application_name")),
            ("count", col(Gauge, "number of connections in this state")),
            (
                "max_tx_duration",
                col(Gauge, "max duration in seconds any active transaction has been running"),
            ),
        ]),
    );

    maps
});

// ----------------------------------------------------------------------------
// Query Overrides
// ----------------------------------------------------------------------------

const LOCKS_QUERY: &str = r#"SELECT pg_database.datname,tmp.mode,COALESCE(count,0) as count
FROM
	(
	  VALUES ('accesssharelock'),
	         ('rowsharelock'),
	         ('rowexclusivelock'),
	         ('shareupdateexclusivelock'),
	         ('sharelock'),
	         ('sharerowexclusivelock'),
	         ('exclusivelock'),
	         ('accessexclusivelock'),
	         ('sireadlock')
	) AS tmp(mode) CROSS JOIN pg_database
LEFT JOIN
	(SELECT database, lower(mode) AS mode,count(*) AS count
	FROM pg_locks WHERE database IS NOT NULL
	GROUP BY database, lower(mode)
) AS tmp2
ON tmp.mode=tmp2.mode and pg_database.oid = tmp2.database ORDER BY 1"#;

const REPLICATION_QUERY_V10: &str = r#"SELECT *,
	(case pg_is_in_recovery() when 't' then null else pg_current_wal_lsn() end) AS pg_current_wal_lsn,
	(case pg_is_in_recovery() when 't' then null else pg_wal_lsn_diff(pg_current_wal_lsn(), pg_lsn('0/0'))::float end) AS pg_current_wal_lsn_bytes,
	(case pg_is_in_recovery() when 't' then null else pg_wal_lsn_diff(pg_current_wal_lsn(), replay_lsn)::float end) AS pg_wal_lsn_diff
FROM pg_stat_replication"#;

const REPLICATION_QUERY_V9_2: &str = r#"SELECT *,
	(case pg_is_in_recovery() when 't' then null else pg_current_xlog_location() end) AS pg_current_xlog_location,
	(case pg_is_in_recovery() when 't' then null else pg_xlog_location_diff(pg_current_xlog_location(), replay_location)::float end) AS pg_xlog_location_diff
FROM pg_stat_replication"#;

const REPLICATION_QUERY_LEGACY: &str = r#"SELECT *,
	(case pg_is_in_recovery() when 't' then null else pg_current_xlog_location() end) AS pg_current_xlog_location
FROM pg_stat_replication"#;

const REPLICATION_SLOTS_QUERY_V9_4: &str = r#"SELECT slot_name, database, active,
	pg_xlog_location_diff(pg_current_xlog_location(), restart_lsn)::float AS pg_wal_lsn_diff
FROM pg_replication_slots"#;

const REPLICATION_SLOTS_QUERY_V10: &str = r#"SELECT slot_name, database, active,
	(case pg_is_in_recovery() when 't'
		then pg_wal_lsn_diff(pg_last_wal_receive_lsn(), restart_lsn)
		else pg_wal_lsn_diff(pg_current_wal_lsn(), restart_lsn) end)::float AS pg_wal_lsn_diff
FROM pg_replication_slots"#;

const ARCHIVER_QUERY: &str = r#"SELECT *,
	extract(epoch from now() - last_archived_time)::float AS last_archive_age
FROM pg_stat_archiver"#;

const ACTIVITY_QUERY: &str = r#"SELECT
	pg_database.datname,
	tmp.state,
	tmp2.usename,
	tmp2.application_name,
	COALESCE(count,0) as count,
	COALESCE(max_tx_duration,0) as max_tx_duration
FROM
	(
	  VALUES ('active'),
	         ('idle'),
	         ('idle in transaction'),
	         ('idle in transaction (aborted)'),
	         ('fastpath function call'),
	         ('disabled')
	) AS tmp(state) CROSS JOIN pg_database
LEFT JOIN
(
	SELECT
		datname,
		state,
		usename,
		application_name,
		count(*) AS count,
		MAX(EXTRACT(EPOCH FROM now() - xact_start))::float AS max_tx_duration
	FROM pg_stat_activity GROUP BY datname,state,usename,application_name) AS tmp2
	ON tmp.state = tmp2.state AND pg_database.datname = tmp2.datname"#;

const ACTIVITY_QUERY_LEGACY: &str = r#"SELECT
	datname,
	'unknown' AS state,
	usename,
	application_name,
	COALESCE(count(*),0) AS count,
	COALESCE(MAX(EXTRACT(EPOCH FROM now() - xact_start))::float,0) AS max_tx_duration
FROM pg_stat_activity GROUP BY datname,usename,application_name"#;

pub static BUILTIN_QUERY_OVERRIDES: Lazy<OverrideTable> = Lazy::new(|| {
    let mut overrides = OverrideTable::new();

    overrides.insert(
        "pg_locks".into(),
        vec![OverrideQuery::new(any_release(), LOCKS_QUERY)],
    );

    overrides.insert(
        "pg_stat_replication".into(),
        vec![
            OverrideQuery::new(VersionRange::at_least(V10), REPLICATION_QUERY_V10),
            OverrideQuery::new(VersionRange::between(V9_2, V10), REPLICATION_QUERY_V9_2),
            OverrideQuery::new(VersionRange::below(V9_2), REPLICATION_QUERY_LEGACY),
        ],
    );

    overrides.insert(
        "pg_replication_slots".into(),
        vec![
            OverrideQuery::new(VersionRange::between(V9_4, V10), REPLICATION_SLOTS_QUERY_V9_4),
            OverrideQuery::new(VersionRange::at_least(V10), REPLICATION_SLOTS_QUERY_V10),
        ],
    );

    overrides.insert(
        "pg_stat_archiver".into(),
        vec![OverrideQuery::new(VersionRange::at_least(Version::new(0, 0, 0)), ARCHIVER_QUERY)],
    );

    overrides.insert(
        "pg_stat_activity".into(),
        vec![
            OverrideQuery::new(VersionRange::at_least(V9_2), ACTIVITY_QUERY),
            OverrideQuery::new(VersionRange::below(V9_2), ACTIVITY_QUERY_LEGACY),
        ],
    );

    overrides
});

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::build_metric_map;
    use crate::overrides::{build_query_overrides, resolve, validate_overrides, ResolvedQuery};

    #[test]
    fn test_builtin_overrides_do_not_overlap() {
        validate_overrides(&BUILTIN_QUERY_OVERRIDES).unwrap();
    }

    #[test]
    fn test_every_override_has_a_column_table() {
        for namespace in BUILTIN_QUERY_OVERRIDES.keys() {
            assert!(BUILTIN_METRIC_MAPS.contains_key(namespace), "{}", namespace);
        }
    }

    #[test]
    fn test_replication_query_per_version() {
        let v96 = build_query_overrides(&Version::new(9, 6, 1), &BUILTIN_QUERY_OVERRIDES);
        assert_eq!(
            resolve(&v96, "pg_stat_replication"),
            ResolvedQuery::Override(REPLICATION_QUERY_V9_2)
        );

        let v91 = build_query_overrides(&Version::new(9, 1, 0), &BUILTIN_QUERY_OVERRIDES);
        assert_eq!(
            resolve(&v91, "pg_stat_replication"),
            ResolvedQuery::Override(REPLICATION_QUERY_LEGACY)
        );
        assert_eq!(resolve(&v91, "pg_replication_slots"), ResolvedQuery::Disabled);
        assert_eq!(resolve(&v91, "pg_stat_bgwriter"), ResolvedQuery::NotConfigured);
    }

    #[test]
    fn test_replication_labels_follow_version() {
        let map = build_metric_map(&Version::new(9, 1, 0), &BUILTIN_METRIC_MAPS, "pg", &BTreeMap::new());
        let labels = &map["pg_stat_replication"].labels;
        assert!(labels.contains(&"procpid".to_string()));
        assert!(!labels.contains(&"pid".to_string()));

        let map = build_metric_map(&Version::new(12, 4, 0), &BUILTIN_METRIC_MAPS, "pg", &BTreeMap::new());
        let ns = &map["pg_stat_replication"];
        assert!(ns.labels.contains(&"pid".to_string()));
        assert!(ns.columns["replay_location"].discard);
        assert!(!ns.columns["pg_wal_lsn_diff"].discard);
        assert!(ns.columns["pg_xlog_location_diff"].discard);
    }

    #[test]
    fn test_builtin_namespaces_are_master_only() {
        assert!(BUILTIN_METRIC_MAPS.values().all(|ns| ns.master_only && ns.cache_seconds == 0));
    }
}
