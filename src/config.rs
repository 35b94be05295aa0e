//! Configuration.
//!
//! Command line flags (via `clap`'s derive `Parser`) take precedence over
//! a TOML config file (`--config`), which in turn takes precedence over
//! the defaults baked in below — the same layering
//! `Config::create` does with its `App`/`Arg` builder, modernized to
//! derive macros the way the rest of the retrieval pack's CLIs are built.

use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use log::error;
use serde::Deserialize;

use crate::error::ExitError;

const DEFAULT_REFRESH: u64 = 600;
const DEFAULT_CHECKTIME_SECS: u64 = 24 * 3600;
const DEFAULT_RTR_REFRESH: u64 = 3600;
const DEFAULT_RTR_RETRY: u64 = 600;
const DEFAULT_RTR_EXPIRE: u64 = 7200;
const DEFAULT_HISTORY_SIZE: usize = 3;
const DEFAULT_MAXCONN: usize = 1000;
const DEFAULT_PROTOCOL: u8 = 1;


//------------ Args (the clap surface) --------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "rtrd", about = "Serves validated ROA payloads over the RPKI-to-Router protocol")]
pub struct Args {
    /// Path to a TOML configuration file, merged underneath these flags.
    #[arg(long)]
    config: Option<PathBuf>,

    /// URI of the upstream VRP JSON cache.
    #[arg(long)]
    cache: Option<String>,

    /// Path to a local SLURM (RFC 8416) exceptions file.
    #[arg(long)]
    slurm: Option<String>,

    /// How often to refresh the SLURM file, in seconds, if different from `cache`.
    #[arg(long)]
    slurm_refresh: Option<u64>,

    /// Refresh interval in seconds.
    #[arg(long)]
    refresh: Option<u64>,

    /// Maximum acceptable age, in seconds, of the upstream document's buildtime.
    #[arg(long)]
    checktime: Option<u64>,

    /// Plain TCP listen addresses for the RTR protocol.
    #[arg(long = "bind")]
    rtr_listen: Vec<SocketAddr>,

    /// TLS listen addresses for the RTR protocol.
    #[arg(long = "tls-bind")]
    tls_listen: Vec<SocketAddr>,

    /// TLS certificate for `--tls-bind`.
    #[arg(long)]
    tls_cert: Option<PathBuf>,

    /// TLS private key for `--tls-bind`.
    #[arg(long)]
    tls_key: Option<PathBuf>,

    /// SSH listen addresses for the RTR protocol.
    #[arg(long = "ssh-bind")]
    ssh_listen: Vec<SocketAddr>,

    /// SSH host key file.
    #[arg(long)]
    ssh_key: Option<PathBuf>,

    /// Require password auth over SSH with the given username.
    #[arg(long)]
    ssh_auth_user: Option<String>,

    /// Password for `--ssh-auth-user` (falls back to `STAYRTR_SSH_PASSWORD`).
    #[arg(long)]
    ssh_auth_password: Option<String>,

    /// Require public-key auth over SSH, checked against this authorized_keys file
    /// (falls back to `STAYRTR_SSH_AUTHORIZEDKEYS`).
    #[arg(long)]
    ssh_auth_key_file: Option<PathBuf>,

    /// Accept any SSH client without authentication. For testing only.
    #[arg(long)]
    ssh_auth_bypass: bool,

    /// RTR session ID. Random if unset.
    #[arg(long)]
    session_id: Option<u16>,

    /// Retained history length (number of past deltas kept for Serial Query).
    #[arg(long)]
    history_size: Option<usize>,

    /// v1 End of Data refresh timer, in seconds.
    #[arg(long)]
    rtr_refresh: Option<u64>,

    /// v1 End of Data retry timer, in seconds.
    #[arg(long)]
    rtr_retry: Option<u64>,

    /// v1 End of Data expire timer, in seconds.
    #[arg(long)]
    rtr_expire: Option<u64>,

    /// Maximum simultaneous RTR client connections.
    #[arg(long)]
    maxconn: Option<usize>,

    /// Highest RTR protocol version (0 or 1) this server will negotiate.
    #[arg(long)]
    protocol: Option<u8>,

    /// Prometheus metrics + JSON export listen address.
    #[arg(long)]
    metrics_bind: Option<SocketAddr>,

    /// Path to a log file (stderr only if unset).
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Increase log verbosity; repeat for more (-v info, -vv debug).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}


//------------ Config ---------------------------------------------------------

/// The fully resolved configuration the rest of the process runs against.
#[derive(Clone, Debug)]
pub struct Config {
    pub cache: String,
    pub slurm: Option<String>,
    pub slurm_refresh: Option<Duration>,
    pub refresh: Duration,
    pub checktime: Duration,

    pub rtr_listen: Vec<SocketAddr>,
    pub tls_listen: Vec<SocketAddr>,
    pub tls_cert: PathBuf,
    pub tls_key: PathBuf,
    pub ssh_listen: Vec<SocketAddr>,
    pub ssh_key: PathBuf,
    pub ssh_auth: SshAuth,

    pub session_id: Option<u16>,
    pub history_size: usize,
    pub rtr_refresh: Duration,
    pub rtr_retry: Duration,
    pub rtr_expire: Duration,
    pub maxconn: usize,
    pub protocol: u8,

    pub metrics_listen: Vec<SocketAddr>,

    pub log_file: Option<PathBuf>,
    pub verbose: u8,
}

#[derive(Clone, Debug)]
pub enum SshAuth {
    None,
    Bypass,
    Password { user: String, password: String },
    AuthorizedKey { file: PathBuf },
}

impl Config {
    pub fn from_args() -> Result<Self, ExitError> {
        let args = Args::parse();
        Self::assemble(args)
    }

    fn assemble(args: Args) -> Result<Self, ExitError> {
        let file = match &args.config {
            Some(path) => Some(ConfigFile::load(path)?),
            None => None,
        };

        let cache = args.cache
            .or_else(|| file.as_ref().and_then(|f| f.cache.clone()))
            .ok_or_else(|| {
                error!("Fatal: --cache (or config file 'cache') is required");
                ExitError::BadArgs
            })?;

        let slurm = args.slurm.or_else(|| file.as_ref().and_then(|f| f.slurm.clone()));
        let slurm_refresh = args.slurm_refresh
            .or_else(|| file.as_ref().and_then(|f| f.slurm_refresh))
            .map(Duration::from_secs);

        let refresh = Duration::from_secs(
            args.refresh.or_else(|| file.as_ref().and_then(|f| f.refresh))
                .unwrap_or(DEFAULT_REFRESH)
        );
        let checktime = Duration::from_secs(
            args.checktime.or_else(|| file.as_ref().and_then(|f| f.checktime))
                .unwrap_or(DEFAULT_CHECKTIME_SECS)
        );

        let rtr_listen = non_empty(args.rtr_listen, file.as_ref().and_then(|f| f.bind.clone()));
        let tls_listen = non_empty(args.tls_listen, file.as_ref().and_then(|f| f.tls_bind.clone()));
        let ssh_listen = non_empty(args.ssh_listen, file.as_ref().and_then(|f| f.ssh_bind.clone()));

        if !tls_listen.is_empty() && (args.tls_cert.is_none() || args.tls_key.is_none()) {
            error!("Fatal: --tls-bind requires --tls-cert and --tls-key");
            return Err(ExitError::BadArgs);
        }
        if !ssh_listen.is_empty() && args.ssh_key.is_none() {
            error!("Fatal: --ssh-bind requires --ssh-key");
            return Err(ExitError::BadArgs);
        }

        let ssh_auth = if args.ssh_auth_bypass {
            SshAuth::Bypass
        } else if let Some(user) = args.ssh_auth_user {
            let password = args.ssh_auth_password
                .or_else(|| std::env::var("STAYRTR_SSH_PASSWORD").ok())
                .ok_or_else(|| {
                    error!("Fatal: --ssh-auth-user requires a password");
                    ExitError::BadArgs
                })?;
            SshAuth::Password { user, password }
        } else if let Some(file) = args.ssh_auth_key_file
            .or_else(|| std::env::var("STAYRTR_SSH_AUTHORIZEDKEYS").ok().map(PathBuf::from))
        {
            SshAuth::AuthorizedKey { file }
        } else {
            SshAuth::None
        };

        Ok(Config {
            cache,
            slurm,
            slurm_refresh,
            refresh,
            checktime,
            rtr_listen,
            tls_listen,
            tls_cert: args.tls_cert.unwrap_or_default(),
            tls_key: args.tls_key.unwrap_or_default(),
            ssh_listen,
            ssh_key: args.ssh_key.unwrap_or_default(),
            ssh_auth,
            session_id: args.session_id,
            history_size: args.history_size
                .or_else(|| file.as_ref().and_then(|f| f.history_size))
                .unwrap_or(DEFAULT_HISTORY_SIZE),
            rtr_refresh: Duration::from_secs(
                args.rtr_refresh.unwrap_or(DEFAULT_RTR_REFRESH)
            ),
            rtr_retry: Duration::from_secs(
                args.rtr_retry.unwrap_or(DEFAULT_RTR_RETRY)
            ),
            rtr_expire: Duration::from_secs(
                args.rtr_expire.unwrap_or(DEFAULT_RTR_EXPIRE)
            ),
            maxconn: args.maxconn
                .or_else(|| file.as_ref().and_then(|f| f.maxconn))
                .unwrap_or(DEFAULT_MAXCONN),
            protocol: args.protocol
                .or_else(|| file.as_ref().and_then(|f| f.protocol))
                .unwrap_or(DEFAULT_PROTOCOL),
            metrics_listen: args.metrics_bind
                .or_else(|| file.as_ref().and_then(|f| f.metrics_bind))
                .into_iter().collect(),
            log_file: args.log_file.or_else(|| file.as_ref().and_then(|f| f.log_file.clone())),
            verbose: args.verbose,
        })
    }
}

fn non_empty(cli: Vec<SocketAddr>, file: Option<Vec<SocketAddr>>) -> Vec<SocketAddr> {
    if !cli.is_empty() { cli } else { file.unwrap_or_default() }
}


//------------ ConfigFile -------------------------------------------------------

/// The optional TOML config file layer.
#[derive(Deserialize, Default)]
struct ConfigFile {
    cache: Option<String>,
    slurm: Option<String>,
    slurm_refresh: Option<u64>,
    refresh: Option<u64>,
    checktime: Option<u64>,
    bind: Option<Vec<SocketAddr>>,
    tls_bind: Option<Vec<SocketAddr>>,
    ssh_bind: Option<Vec<SocketAddr>>,
    history_size: Option<usize>,
    maxconn: Option<usize>,
    protocol: Option<u8>,
    metrics_bind: Option<SocketAddr>,
    log_file: Option<PathBuf>,
}

impl ConfigFile {
    fn load(path: &PathBuf) -> Result<Self, ExitError> {
        let data = fs::read_to_string(path).map_err(|err| {
            error!("Fatal: failed to read config file '{}': {}", path.display(), err);
            ExitError::BadArgs
        })?;
        toml::from_str(&data).map_err(|err| {
            error!("Fatal: malformed config file '{}': {}", path.display(), err);
            ExitError::BadArgs
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_file_parses_minimal_document() {
        let file: ConfigFile = toml::from_str(r#"cache = "https://example.test/vrps.json""#).unwrap();
        assert_eq!(file.cache.as_deref(), Some("https://example.test/vrps.json"));
    }

    #[test]
    fn non_empty_prefers_cli_over_file() {
        let cli = vec!["127.0.0.1:8282".parse().unwrap()];
        let file = Some(vec!["127.0.0.1:9999".parse().unwrap()]);
        assert_eq!(non_empty(cli.clone(), file), cli);
    }

    #[test]
    fn non_empty_falls_back_to_file() {
        let file = vec!["127.0.0.1:9999".parse().unwrap()];
        assert_eq!(non_empty(Vec::new(), Some(file.clone())), file);
    }
}
