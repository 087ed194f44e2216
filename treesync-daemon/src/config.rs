//! TOML configuration.
//!
//! ```toml
//! port = 3025
//! ssh_command = "/usr/bin/ssh"
//! ssh_user = "tsync"
//!
//! [[watchpoint]]
//! path = "/data/share"
//! export = "share"
//! readonly = false
//! exclude = ["*.swp"]
//!
//! [[watchpoint.import]]
//! ssh = true
//! server = "files.example.net"
//! name = "share"
//! translate = "office"
//!
//! [translate.office]
//! uid = [[1000, 500]]
//! gid = [[100, 500]]
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::warn;
use treesync_engine::IdTranslator;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/treesync.toml";
pub const DEFAULT_STATE_ROOT: &str = "/var/lib/treesync";

fn default_port() -> u16 {
    3025
}

fn default_ssh_command() -> PathBuf {
    PathBuf::from("/usr/bin/ssh")
}

fn default_ssh_user() -> String {
    "tsync".to_string()
}

fn default_true() -> bool {
    true
}

fn default_state_root() -> PathBuf {
    PathBuf::from(DEFAULT_STATE_ROOT)
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_ssh_command")]
    pub ssh_command: PathBuf,
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    #[serde(default = "default_true")]
    pub accept_keys: bool,
    #[serde(default = "default_state_root")]
    pub state_root: PathBuf,
    #[serde(default, rename = "watchpoint")]
    pub watchpoints: Vec<WatchPointConfig>,
    #[serde(default)]
    pub translate: BTreeMap<String, TranslateConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchPointConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub export: String,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default, rename = "import")]
    pub imports: Vec<ImportConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImportConfig {
    #[serde(default)]
    pub ssh: bool,
    pub server: String,
    /// Defaults to `server` when left empty.
    #[serde(default)]
    pub gateway: String,
    #[serde(default = "default_ssh_user")]
    pub user: String,
    /// Export name on the remote side.
    pub name: String,
    #[serde(default)]
    pub translate: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl ImportConfig {
    /// Connection pool key; imports sharing a key share one connection.
    pub fn pool_key(&self) -> String {
        format!(
            "{}@{}/{}:{}",
            self.user, self.gateway, self.server, self.port
        )
    }
}

/// Pairs of `[client_id, server_id]`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TranslateConfig {
    #[serde(default)]
    pub uid: Vec<[u32; 2]>,
    #[serde(default)]
    pub gid: Vec<[u32; 2]>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("cannot parse config file {}", path.display()))?;
        config.normalize();
        Ok(config)
    }

    fn normalize(&mut self) {
        for wp in &mut self.watchpoints {
            for import in &mut wp.imports {
                if import.gateway.is_empty() {
                    import.gateway = import.server.clone();
                }
                if !import.translate.is_empty() && !self.translate.contains_key(&import.translate)
                {
                    warn!(
                        "import of {} names unknown translate table {}",
                        import.name, import.translate
                    );
                }
            }
        }
    }

    /// Build the uid/gid translator an import references; an unknown or
    /// empty name yields the identity.
    pub fn translator(&self, name: &str) -> Option<IdTranslator> {
        if name.is_empty() {
            return None;
        }
        let table = self.translate.get(name)?;
        let mut translator = IdTranslator::new();
        for [client, server] in &table.uid {
            translator.add_uid(*server, *client);
        }
        for [client, server] in &table.gid {
            translator.add_gid(*server, *client);
        }
        Some(translator)
    }
}

/// Resolve a system user to (uid, home). The tunnel subprocess drops to
/// this user, and its SSH keys drive the key exchange.
pub fn lookup_user(name: &str) -> Option<(u32, PathBuf)> {
    use std::ffi::{CStr, CString};

    let c_name = CString::new(name).ok()?;
    // Safety: getpwnam returns a pointer to static storage; we copy the
    // fields out before any other libc call can clobber it.
    unsafe {
        let pw = libc::getpwnam(c_name.as_ptr());
        if pw.is_null() {
            return None;
        }
        let uid = (*pw).pw_uid;
        let home = CStr::from_ptr((*pw).pw_dir).to_string_lossy().into_owned();
        Some((uid, PathBuf::from(home)))
    }
}
