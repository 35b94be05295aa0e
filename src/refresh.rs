//! The refresh loop: periodically fetch the upstream VRP document, apply
//! the SLURM overlay, and install the result into the shared history.
//!
//! Modeled as a timer loop in the style of `update_future`, which looped
//! a repository update over a fixed timer; here the timer drives a fetch
//! instead, and the "did anything change" question is answered by
//! [`History::update`] rather than an RRDP/rsync repository diff.

use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use ring::digest::{digest, SHA256};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::fetch::{FetchResult, Fetcher};
use crate::metrics::{FetchMetrics, FetchStatus, SharedRefreshMetrics};
use crate::payload::{SharedHistory, VrpSet};
use crate::rtr::Notifier;
use crate::slurm::LocalExceptions;
use crate::vrp::VrpDocument;

const FIRST_REFRESH_DELAY: Duration = Duration::from_secs(30);

/// Drives the periodic fetch/decode/install cycle.
pub struct RefreshLoop {
    config_refresh: Duration,
    config_checktime: Duration,
    slurm_refresh: Option<Duration>,
    cache: Fetcher,
    slurm: Option<Fetcher>,
    exceptions: LocalExceptions,
    last_slurm_fetch: Option<DateTime<Utc>>,
    cache_hash: Option<[u8; 32]>,
    slurm_hash: Option<[u8; 32]>,
    history: SharedHistory,
    notifier: Notifier,
    metrics: SharedRefreshMetrics,
    trigger: mpsc::Receiver<()>,
}

impl RefreshLoop {
    pub fn new(
        config: &Config,
        history: SharedHistory,
        notifier: Notifier,
        metrics: SharedRefreshMetrics,
        trigger: mpsc::Receiver<()>,
    ) -> Self {
        RefreshLoop {
            config_refresh: config.refresh,
            config_checktime: config.checktime,
            slurm_refresh: config.slurm_refresh,
            cache: Fetcher::new(config.cache.clone()),
            slurm: config.slurm.clone().map(Fetcher::new),
            exceptions: LocalExceptions::empty(),
            last_slurm_fetch: None,
            cache_hash: None,
            slurm_hash: None,
            history,
            notifier,
            metrics,
            trigger,
        }
    }

    /// Runs the loop forever. Never returns under normal operation.
    ///
    /// Before the first successful install, every tick (not just the very
    /// first one) is forced to `FIRST_REFRESH_DELAY` rather than the
    /// configured interval, so a failing upstream gets retried quickly
    /// instead of waiting out a multi-minute `refresh` period with nothing
    /// installed yet.
    pub async fn run(mut self) {
        let mut installed = self.history.read().await.serial() != crate::rtr::Serial(0);
        loop {
            let delay = if installed { self.config_refresh } else { FIRST_REFRESH_DELAY };

            let mut sleep = Box::pin(tokio::time::sleep(delay));
            tokio::select! {
                _ = &mut sleep => { }
                _ = self.trigger.recv() => {
                    debug!("Refresh triggered out of cycle.");
                }
            }

            if let Err(_failed) = self.run_once().await {
                // Already logged at the point of failure; prior state
                // stands and the loop continues on the next tick.
            }

            if !installed {
                installed = self.history.read().await.serial() != crate::rtr::Serial(0);
            }
        }
    }

    async fn run_once(&mut self) -> Result<(), ()> {
        let body = match self.cache.fetch().await {
            Ok(FetchResult::Unchanged) => {
                let uri = self.cache.uri().to_string();
                self.record_source(uri, FetchStatus::Unchanged, false).await;
                return Ok(());
            }
            Ok(FetchResult::Changed { body, .. }) => body,
            Err(_) => {
                let uri = self.cache.uri().to_string();
                self.record_source(uri, FetchStatus::Failed, false).await;
                return Err(());
            }
        };

        let hash = digest(&SHA256, body.as_bytes());
        let hash: [u8; 32] = hash.as_ref().try_into().expect("SHA-256 is 32 bytes");
        if Some(hash) == self.cache_hash {
            debug!("Upstream content hash unchanged.");
            let uri = self.cache.uri().to_string();
            self.record_source(uri, FetchStatus::Unchanged, false).await;
            return Ok(());
        }

        let document: VrpDocument = match serde_json::from_str(&body) {
            Ok(document) => document,
            Err(err) => {
                warn!("Malformed upstream VRP document: {}", err);
                let uri = self.cache.uri().to_string();
                self.record_source(uri, FetchStatus::Failed, false).await;
                return Err(());
            }
        };

        if self.config_checktime.as_secs() > 0 {
            if let Some(buildtime) = DateTime::parse_from_rfc3339(&document.metadata.buildtime).ok() {
                let age = Utc::now().signed_duration_since(buildtime.with_timezone(&Utc));
                if age.to_std().unwrap_or_default() > self.config_checktime {
                    warn!(
                        "Upstream document is stale (buildtime {}); rejecting cycle.",
                        document.metadata.buildtime,
                    );
                    let uri = self.cache.uri().to_string();
                    self.record_source(uri, FetchStatus::Failed, false).await;
                    return Err(());
                }
            } else {
                warn!("Upstream document has an unparsable buildtime; rejecting cycle.");
                let uri = self.cache.uri().to_string();
                self.record_source(uri, FetchStatus::Failed, false).await;
                return Err(());
            }
        }

        self.refresh_slurm().await;

        let buildtime = document.metadata.buildtime.clone();
        let raw_count = document.roas.len();
        let mut deduped = VrpSet::new();
        let mut filtered_count = 0;
        for raw in document.roas {
            let vrp = match raw.into_vrp() {
                Some(vrp) => vrp,
                None => continue,
            };
            if self.exceptions.keep(&vrp) {
                deduped.insert(vrp);
            } else {
                filtered_count += 1;
            }
        }
        let asserted_count = self.exceptions.assertions().len();
        for vrp in self.exceptions.assertions() {
            deduped.insert(*vrp);
        }

        let v4_count = deduped.v4_count();
        let v6_count = deduped.v6_count();
        let deduped_count = deduped.len();

        let changed = {
            let mut history = self.history.write().await;
            history.update(deduped, buildtime)
        };

        self.cache_hash = Some(hash);
        let uri = self.cache.uri().to_string();
        self.record_source(uri, FetchStatus::Updated, true).await;

        {
            let mut metrics = self.metrics.write().await;
            metrics.vrp_total_raw = raw_count;
            metrics.vrp_total_deduped = deduped_count;
            metrics.vrp_v4 = v4_count;
            metrics.vrp_v6 = v6_count;
            metrics.filtered_count = filtered_count;
            metrics.asserted_count = asserted_count;
        }

        if changed {
            let serial = self.history.read().await.serial();
            info!("Installed new VRP set at serial {}.", u32::from(serial));
            self.notifier.notify(serial);
        } else {
            debug!("VRP set unchanged after SLURM and dedup; nothing installed.");
        }

        Ok(())
    }

    async fn refresh_slurm(&mut self) {
        let fetcher = match &mut self.slurm {
            Some(fetcher) => fetcher,
            None => return,
        };

        if let Some(period) = self.slurm_refresh {
            if let Some(last) = self.last_slurm_fetch {
                if Utc::now().signed_duration_since(last).to_std().unwrap_or_default() < period {
                    return;
                }
            }
        } else if self.last_slurm_fetch.is_some() {
            // No periodic refresh configured: fetch once at startup only.
            return;
        }

        let uri = fetcher.uri().to_string();
        match fetcher.fetch().await {
            Ok(FetchResult::Unchanged) => {
                self.last_slurm_fetch = Some(Utc::now());
                self.record_source(uri, FetchStatus::Unchanged, false).await;
            }
            Ok(FetchResult::Changed { body, .. }) => {
                let hash = digest(&SHA256, body.as_bytes());
                let hash: [u8; 32] = hash.as_ref().try_into().expect("SHA-256 is 32 bytes");
                if Some(hash) == self.slurm_hash {
                    self.last_slurm_fetch = Some(Utc::now());
                    self.record_source(uri, FetchStatus::Unchanged, false).await;
                    return;
                }
                match LocalExceptions::from_json_str(&body) {
                    Ok(exceptions) => {
                        self.exceptions = exceptions;
                        self.slurm_hash = Some(hash);
                        self.last_slurm_fetch = Some(Utc::now());
                        self.record_source(uri, FetchStatus::Updated, true).await;
                    }
                    Err(err) => {
                        warn!("Malformed SLURM document: {}", err);
                        self.last_slurm_fetch = Some(Utc::now());
                        self.record_source(uri, FetchStatus::Failed, false).await;
                    }
                }
            }
            Err(_) => {
                self.last_slurm_fetch = Some(Utc::now());
                self.record_source(uri, FetchStatus::Failed, false).await;
            }
        }
    }

    async fn record_source(&self, uri: String, status: FetchStatus, changed: bool) {
        let now = Utc::now();
        let mut metrics = self.metrics.write().await;
        let entry = metrics.sources.entry(uri).or_insert_with(FetchMetrics::default);
        entry.last_refresh = Some(now);
        entry.last_status = status;
        if changed {
            entry.last_change = Some(now);
        }
        match status {
            FetchStatus::Updated | FetchStatus::Unchanged => entry.success_count += 1,
            FetchStatus::Failed => entry.failure_count += 1,
            FetchStatus::Pending => {}
        }
        if status != FetchStatus::Failed {
            entry.last_success = Some(now);
        }
    }
}

/// Creates the trigger channel used for out-of-cycle ("SIGHUP-equivalent")
/// refreshes.
pub fn trigger_channel() -> (mpsc::Sender<()>, mpsc::Receiver<()>) {
    mpsc::channel(1)
}


#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::config::{Config, SshAuth};
    use crate::payload;

    fn test_config(cache_uri: String, checktime: Duration) -> Config {
        Config {
            cache: cache_uri,
            slurm: None,
            slurm_refresh: None,
            refresh: Duration::from_secs(600),
            checktime,
            rtr_listen: Vec::new(),
            tls_listen: Vec::new(),
            tls_cert: PathBuf::new(),
            tls_key: PathBuf::new(),
            ssh_listen: Vec::new(),
            ssh_key: PathBuf::new(),
            ssh_auth: SshAuth::None,
            session_id: Some(1),
            history_size: 3,
            rtr_refresh: Duration::from_secs(3600),
            rtr_retry: Duration::from_secs(600),
            rtr_expire: Duration::from_secs(7200),
            maxconn: 1000,
            protocol: 1,
            metrics_listen: Vec::new(),
            log_file: None,
            verbose: 0,
        }
    }

    fn write_fixture(name: &str, body: &str) -> String {
        let path = std::env::temp_dir().join(name);
        std::fs::write(&path, body).unwrap();
        format!("file://{}", path.display())
    }

    async fn new_loop(config: &Config) -> (RefreshLoop, SharedHistory, crate::rtr::Listener) {
        let history = payload::shared(1, config.history_size);
        let (notifier, listener) = crate::rtr::channel(crate::rtr::Serial(0));
        let metrics = crate::metrics::shared_refresh_metrics();
        let (_trigger_tx, trigger_rx) = trigger_channel();
        let refresh_loop = RefreshLoop::new(config, history.clone(), notifier, metrics, trigger_rx);
        (refresh_loop, history, listener)
    }

    #[tokio::test]
    async fn fresh_document_is_installed() {
        let uri = write_fixture(
            "rtrd-refresh-fresh.json",
            &format!(
                r#"{{"metadata":{{"buildtime":"{}"}},"roas":[
                    {{"prefix":"10.0.0.0/24","asn":"AS64496","maxLength":24}}
                ]}}"#,
                Utc::now().to_rfc3339(),
            ),
        );
        let config = test_config(uri, Duration::from_secs(24 * 3600));
        let (mut refresh_loop, history, _listener) = new_loop(&config).await;

        assert!(refresh_loop.run_once().await.is_ok());
        let snapshot = history.read().await.current();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(history.read().await.serial(), crate::rtr::Serial(1));
    }

    #[tokio::test]
    async fn refresh_cycle_pins_raw_deduped_filtered_and_asserted_counts() {
        let slurm_uri = write_fixture(
            "rtrd-refresh-slurm.json",
            r#"{
                "slurmVersion": 1,
                "validationOutputFilters": {"prefixFilters": [{"asn": 64497}]},
                "locallyAddedAssertions": {"prefixAssertions": [
                    {"prefix": "10.3.0.0/24", "asn": 64499, "maxPrefixLength": 24}
                ]}
            }"#,
        );
        let uri = write_fixture(
            "rtrd-refresh-counts.json",
            &format!(
                r#"{{"metadata":{{"buildtime":"{}"}},"roas":[
                    {{"prefix":"10.0.0.0/24","asn":"AS64496","maxLength":24}},
                    {{"prefix":"10.1.0.0/24","asn":"AS64497","maxLength":24}},
                    {{"prefix":"10.2.0.0/24","asn":"AS64498","maxLength":24}}
                ]}}"#,
                Utc::now().to_rfc3339(),
            ),
        );
        let mut config = test_config(uri, Duration::from_secs(24 * 3600));
        config.slurm = Some(slurm_uri);
        let (mut refresh_loop, history, _listener) = new_loop(&config).await;

        assert!(refresh_loop.run_once().await.is_ok());

        let snapshot = history.read().await.current();
        assert_eq!(snapshot.len(), 3);
        assert!(history.read().await.buildtime().is_some());

        let metrics = refresh_loop_metrics(&refresh_loop).await;
        assert_eq!(metrics.vrp_total_raw, 3);
        assert_eq!(metrics.vrp_total_deduped, 3);
        assert_eq!(metrics.filtered_count, 1);
        assert_eq!(metrics.asserted_count, 1);
    }

    async fn refresh_loop_metrics(refresh_loop: &RefreshLoop) -> crate::metrics::RefreshMetrics {
        refresh_loop.metrics.read().await.clone()
    }

    #[tokio::test]
    async fn stale_document_is_rejected_and_state_is_untouched() {
        let uri = write_fixture(
            "rtrd-refresh-stale.json",
            &format!(
                r#"{{"metadata":{{"buildtime":"{}"}},"roas":[
                    {{"prefix":"10.0.0.0/24","asn":"AS64496","maxLength":24}}
                ]}}"#,
                (Utc::now() - chrono::Duration::hours(25)).to_rfc3339(),
            ),
        );
        let config = test_config(uri, Duration::from_secs(24 * 3600));
        let (mut refresh_loop, history, _listener) = new_loop(&config).await;

        assert!(refresh_loop.run_once().await.is_err());
        let snapshot = history.read().await.current();
        assert!(snapshot.is_empty());
        assert_eq!(history.read().await.serial(), crate::rtr::Serial(0));
    }
}
