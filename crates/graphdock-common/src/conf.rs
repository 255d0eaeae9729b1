//! Server configuration settings whose names differ between release branches.

use std::path::{Path, PathBuf};

use crate::version::{V5_0_0, Version};

/// Configuration settings the harness needs to set or look up.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Setting {
    AllowUpgrade,
    BackupEnabled,
    BackupListenAddress,
    DefaultListenAddress,
    DirectoriesData,
    DirectoriesLogs,
    DirectoriesMetrics,
    HttpListenAddress,
    JvmAdditional,
    LogsGcRotationKeepNumber,
    MemoryHeapInitialSize,
    MemoryHeapMaxSize,
    MemoryPagecacheSize,
    SecurityProceduresUnrestricted,
    TxLogRetentionPolicy,
}

impl Setting {
    /// Every setting, in declaration order.
    pub const ALL: [Self; 15] = [
        Self::AllowUpgrade,
        Self::BackupEnabled,
        Self::BackupListenAddress,
        Self::DefaultListenAddress,
        Self::DirectoriesData,
        Self::DirectoriesLogs,
        Self::DirectoriesMetrics,
        Self::HttpListenAddress,
        Self::JvmAdditional,
        Self::LogsGcRotationKeepNumber,
        Self::MemoryHeapInitialSize,
        Self::MemoryHeapMaxSize,
        Self::MemoryPagecacheSize,
        Self::SecurityProceduresUnrestricted,
        Self::TxLogRetentionPolicy,
    ];

    /// The configuration key for this setting on the given server version.
    ///
    /// Returns `None` when the server has no such setting; from 5.0 store
    /// upgrades happen automatically and the upgrade flag is gone.
    #[must_use]
    pub fn name_for(self, version: &Version) -> Option<&'static str> {
        if version.is_at_least(&V5_0_0) {
            self.name_5x()
        } else {
            Some(self.name_4x())
        }
    }

    const fn name_4x(self) -> &'static str {
        match self {
            Self::AllowUpgrade => "dbms.allow_upgrade",
            Self::BackupEnabled => "dbms.backup.enabled",
            Self::BackupListenAddress => "dbms.backup.listen_address",
            Self::DefaultListenAddress => "dbms.default_listen_address",
            Self::DirectoriesData => "dbms.directories.data",
            Self::DirectoriesLogs => "dbms.directories.logs",
            Self::DirectoriesMetrics => "dbms.directories.metrics",
            Self::HttpListenAddress => "dbms.connector.http.listen_address",
            Self::JvmAdditional => "dbms.jvm.additional",
            Self::LogsGcRotationKeepNumber => "dbms.logs.gc.rotation.keep_number",
            Self::MemoryHeapInitialSize => "dbms.memory.heap.initial_size",
            Self::MemoryHeapMaxSize => "dbms.memory.heap.max_size",
            Self::MemoryPagecacheSize => "dbms.memory.pagecache.size",
            Self::SecurityProceduresUnrestricted => "dbms.security.procedures.unrestricted",
            Self::TxLogRetentionPolicy => "dbms.tx_log.rotation.retention_policy",
        }
    }

    const fn name_5x(self) -> Option<&'static str> {
        Some(match self {
            Self::AllowUpgrade => return None,
            Self::BackupEnabled => "server.backup.enabled",
            Self::BackupListenAddress => "server.backup.listen_address",
            Self::DefaultListenAddress => "server.default_listen_address",
            Self::DirectoriesData => "server.directories.data",
            Self::DirectoriesLogs => "server.directories.logs",
            Self::DirectoriesMetrics => "server.directories.metrics",
            Self::HttpListenAddress => "server.http.listen_address",
            Self::JvmAdditional => "server.jvm.additional",
            Self::LogsGcRotationKeepNumber => "server.logs.gc.rotation.keep_number",
            Self::MemoryHeapInitialSize => "server.memory.heap.initial_size",
            Self::MemoryHeapMaxSize => "server.memory.heap.max_size",
            Self::MemoryPagecacheSize => "server.memory.pagecache.size",
            Self::SecurityProceduresUnrestricted => "dbms.security.procedures.unrestricted",
            Self::TxLogRetentionPolicy => "db.tx_log.rotation.retention_policy",
        })
    }

    /// The container environment variable carrying this setting, if the
    /// server version has it.
    #[must_use]
    pub fn env_var_for(self, version: &Version) -> Option<String> {
        self.name_for(version).map(env_var_for)
    }
}

/// Encode a configuration key as a container environment variable.
///
/// The image entrypoint reverses this: `_` is written as `__`, `-` as `___`
/// and `.` as `_`, all behind a `NEO4J_` prefix.
#[must_use]
pub fn env_var_for(key: &str) -> String {
    let encoded = key
        .replace('_', "__")
        .replace('-', "___")
        .replace('.', "_");
    format!("NEO4J_{encoded}")
}

/// Folder holding configuration fixtures for the version's release branch.
#[must_use]
pub fn fixture_folder(root: &Path, version: &Version) -> PathBuf {
    root.join(version.branch())
}
