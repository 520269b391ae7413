use crate::HandlerApi;
use crate::apps::qos::{MeterBackend, QosBackend, QosManager, SystemTc, TcBackend};
use crate::apps::redirect::{DnsCache, RedirectManager, RedirectShared, Resolver};
use crate::apps::{
    CheckQuotaController, Classifier, EnforcementController, EnforcementStats, EnrichmentProxy,
    HeController, UeMacController,
};
use crate::data::{Config, ControllerContext, MemoryStore, QosImpl, RequestOrigin, UsageReporter};
use crate::datapath::{ConnectionEvent, Datapath, FlowProgrammer};
use crate::procedures::RpcHandler;
use crate::tables::app_names::*;
use crate::tables::{EGRESS_TABLE, RuleIdRegistry, RuleVersionTracker, TableAllocator};
use anyhow::Result;
use async_channel::Receiver;
use async_std::sync::Mutex;
use async_trait::async_trait;
use futures::StreamExt;
use openflow::{Switch, SwitchEvent, TableId};
use slog::{Logger, info, o, warn};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use stop_token::prelude::*;
use stop_token::{StopSource, StopToken};

struct Apps {
    classifier: Classifier,
    ue_mac: Option<UeMacController>,
    check_quota: Option<CheckQuotaController>,
    he: Option<HeController>,
    gy: Option<EnforcementController>,
    enforcement: Option<EnforcementController>,
    enforcement_stats: Option<EnforcementStats>,
    qos: Option<Arc<QosManager>>,
}

#[derive(Clone)]
pub struct Pipelined {
    config: Config,
    context: Arc<ControllerContext>,
    tables: Arc<TableAllocator>,
    versions: RuleVersionTracker,
    flows: FlowProgrammer,
    apps: Arc<Apps>,
    connection_events: Receiver<ConnectionEvent>,
    stop_source: Arc<Mutex<Option<StopSource>>>,
    stop_token: StopToken,
    logger: Logger,
}

impl Pipelined {
    pub async fn start<S: Switch>(
        config: Config,
        switch: S,
        switch_events: Receiver<SwitchEvent>,
        reporter: Arc<dyn UsageReporter>,
        resolver: Arc<dyn Resolver>,
        proxy: Arc<dyn EnrichmentProxy>,
        logger: Logger,
    ) -> Result<Self> {
        let pipelined = Self::new(
            config,
            switch,
            switch_events,
            reporter,
            resolver,
            proxy,
            logger,
        )?;
        pipelined.run();
        Ok(pipelined)
    }

    fn new<S: Switch>(
        config: Config,
        switch: S,
        switch_events: Receiver<SwitchEvent>,
        reporter: Arc<dyn UsageReporter>,
        resolver: Arc<dyn Resolver>,
        proxy: Arc<dyn EnrichmentProxy>,
        logger: Logger,
    ) -> Result<Self> {
        let tables = TableAllocator::build(&config.static_apps, &config.dynamic_apps)?;
        for assignment in tables.assignments() {
            info!(
                logger,
                "Table {} for {} (scratch {:?})",
                assignment.main_table,
                assignment.app_name,
                assignment.scratch_tables
            );
        }

        let epoch = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
        let context = Arc::new(ControllerContext::new(epoch));
        info!(logger, "Controller epoch {epoch}");

        let stop_source = StopSource::new();
        let stop_token = stop_source.token();
        let (datapath, connection_events) = Datapath::spawn(
            switch,
            switch_events,
            stop_token.clone(),
            logger.new(o!("datapath" => config.bridge_name.clone())),
        );
        let flows = FlowProgrammer::new(
            datapath,
            config.barrier_timeout(),
            config.barrier_retries,
            &logger,
        );

        let versions = RuleVersionTracker::in_memory();
        let rule_ids = RuleIdRegistry::in_memory();
        let apps = Self::build_apps(
            &config,
            &tables,
            &flows,
            &versions,
            &rule_ids,
            &context,
            reporter,
            resolver,
            proxy,
            &logger,
        )?;

        Ok(Pipelined {
            config,
            context,
            tables: Arc::new(tables),
            versions,
            flows,
            apps: Arc::new(apps),
            connection_events,
            stop_source: Arc::new(Mutex::new(Some(stop_source))),
            stop_token,
            logger,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn build_apps(
        config: &Config,
        tables: &TableAllocator,
        flows: &FlowProgrammer,
        versions: &RuleVersionTracker,
        rule_ids: &RuleIdRegistry,
        context: &Arc<ControllerContext>,
        reporter: Arc<dyn UsageReporter>,
        resolver: Arc<dyn Resolver>,
        proxy: Arc<dyn EnrichmentProxy>,
        logger: &Logger,
    ) -> Result<Apps> {
        let classifier = Classifier::new(
            flows.clone(),
            tables.main_table(CLASSIFIER)?,
            tables.next_table(CLASSIFIER)?,
            config.uplink_port,
            config.gtp_port,
            tables.is_registered(HE).then_some(config.proxy_port),
            &logger.new(o!("app" => CLASSIFIER)),
        );

        let ue_mac = if tables.is_registered(UE_MAC) {
            Some(UeMacController::new(
                flows.clone(),
                tables.main_table(UE_MAC)?,
                tables.next_table(UE_MAC)?,
                &logger.new(o!("app" => UE_MAC)),
            ))
        } else {
            None
        };

        let check_quota = if tables.is_registered(CHECK_QUOTA) {
            Some(CheckQuotaController::new(
                flows.clone(),
                tables.main_table(CHECK_QUOTA)?,
                tables.next_table(CHECK_QUOTA)?,
                &logger.new(o!("app" => CHECK_QUOTA)),
            ))
        } else {
            None
        };

        let he = if tables.is_registered(HE) {
            Some(HeController::new(
                flows.clone(),
                tables.main_table(HE)?,
                tables.next_table(HE)?,
                config.proxy_port,
                proxy,
                &logger.new(o!("app" => HE)),
            ))
        } else {
            None
        };

        let qos = if config.qos.enable {
            let qos_logger = logger.new(o!("app" => "qos"));
            let (backend, range): (Arc<dyn QosBackend>, _) = match config.qos.qos_impl {
                QosImpl::OvsMeter => (
                    Arc::new(MeterBackend::new(
                        flows.clone(),
                        config.enforcement.stats_reply_timeout(),
                    )),
                    config.qos.ovs_meter,
                ),
                QosImpl::LinuxTc => (
                    Arc::new(TcBackend::new(
                        &config.nat_iface,
                        &config.enodeb_iface,
                        config.qos.max_rate,
                        Arc::new(SystemTc),
                        &qos_logger,
                    )),
                    config.qos.linux_tc,
                ),
            };
            Some(Arc::new(QosManager::new(
                backend,
                Arc::new(MemoryStore::new()),
                range,
                config.qos.max_rate,
                &qos_logger,
            )))
        } else {
            None
        };

        let redirect = Arc::new(RedirectShared {
            resolver,
            cache: DnsCache::new(config.redirect.dns_cache_ttl()),
            store: Arc::new(MemoryStore::new()),
            dns_timeout: config.redirect.dns_timeout(),
            bridge_ip: config.bridge_ip_address,
            http_port: config.http_port,
        });

        let stats_table = if tables.is_registered(ENFORCEMENT_STATS) {
            Some(tables.main_table(ENFORCEMENT_STATS)?)
        } else {
            None
        };

        let enforcement_app = |app_name: &'static str,
                               rule_next_table: TableId,
                               miss_next_table: TableId,
                               he: Option<HeController>|
         -> Result<Option<EnforcementController>> {
            if !tables.is_registered(app_name) {
                return Ok(None);
            }
            let app_logger = logger.new(o!("app" => app_name));
            let table = tables.main_table(app_name)?;
            let scratch_table = tables
                .scratch_tables(app_name)?
                .first()
                .copied()
                .unwrap_or(EGRESS_TABLE);
            let redirect = RedirectManager::new(
                flows.clone(),
                table,
                rule_next_table,
                scratch_table,
                versions.clone(),
                redirect.clone(),
                &app_logger,
            );
            Ok(Some(EnforcementController::new(
                app_name,
                flows.clone(),
                table,
                scratch_table,
                rule_next_table,
                miss_next_table,
                rule_ids.clone(),
                qos.clone(),
                redirect,
                he,
                &app_logger,
            )))
        };

        // Traffic that a Gy rule matches skips Gx enforcement; the rest falls through to it.
        let gy = if tables.is_registered(GY) {
            let miss_next = tables.next_table(GY)?;
            enforcement_app(GY, stats_table.unwrap_or(miss_next), miss_next, None)?
        } else {
            None
        };
        let enforcement = if tables.is_registered(ENFORCEMENT) {
            let next = tables.next_table(ENFORCEMENT)?;
            enforcement_app(ENFORCEMENT, next, next, he.clone())?
        } else {
            None
        };

        let enforcement_stats = match stats_table {
            Some(table) => Some(EnforcementStats::new(
                flows.clone(),
                table,
                tables.next_table(ENFORCEMENT_STATS)?,
                versions.clone(),
                rule_ids.clone(),
                reporter,
                context.clone(),
                config.enforcement.stats_reply_timeout(),
                config.enforcement.poll_interval(),
                &logger.new(o!("app" => ENFORCEMENT_STATS)),
            )),
            None => None,
        };

        Ok(Apps {
            classifier,
            ue_mac,
            check_quota,
            he,
            gy,
            enforcement,
            enforcement_stats,
            qos,
        })
    }

    fn run(&self) {
        let pipelined = self.clone();
        async_std::task::spawn(async move {
            let events = pipelined
                .connection_events
                .clone()
                .timeout_at(pipelined.stop_token.clone());
            let mut events = Box::pin(events);
            while let Some(Ok(event)) = events.next().await {
                match event {
                    ConnectionEvent::Connected(dpid) => {
                        info!(pipelined.logger, "Datapath {dpid:#x} connected");
                        if let Err(e) = pipelined.handle_connected().await {
                            warn!(pipelined.logger, "Failed to initialize datapath - {e}");
                        }
                    }
                    ConnectionEvent::Disconnected => {
                        warn!(pipelined.logger, "Datapath disconnected");
                    }
                }
            }
        });

        if let Some(stats) = &self.apps.enforcement_stats {
            stats.spawn_poller(self.stop_token.clone());
        }
    }

    // Datapath Connected Procedure
    // 1.    Forget which controllers have replayed their state
    // 2.    Wipe the tables, if configured to start clean
    // 3.    Reconcile QoS queues
    // 4.    Install the table defaults of every app
    // 5.    Reinstall the GTP tunnels already known
    async fn handle_connected(&self) -> Result<()> {
        self.context.reset_setup();
        if self.config.clean_restart {
            for table in self.all_tables() {
                self.flows.delete_all_flows_in_table(table).await?;
            }
        }
        if let Some(qos) = &self.apps.qos {
            qos.startup(self.config.clean_restart).await?;
        }
        self.install_default_flows(&self.logger).await?;
        self.apps.classifier.restore_sessions().await
    }

    fn all_tables(&self) -> Vec<TableId> {
        let mut tables: Vec<TableId> = self
            .tables
            .assignments()
            .into_iter()
            .flat_map(|a| std::iter::once(a.main_table).chain(a.scratch_tables))
            .collect();
        tables.push(EGRESS_TABLE);
        tables
    }

    pub fn epoch(&self) -> u64 {
        self.context.epoch()
    }

    /// Run a stats poll cycle now rather than waiting for the poller.
    pub async fn poll_usage(&self) -> Result<()> {
        match &self.apps.enforcement_stats {
            Some(stats) => stats.poll_once().await,
            None => Ok(()),
        }
    }

    pub fn rpc_handler(&self) -> RpcHandler<Self> {
        RpcHandler::new(self.clone(), &self.logger.new(o!("service" => "control")))
    }

    pub async fn graceful_shutdown(self) {
        info!(&self.logger, "Shutting down");
        self.stop_source.lock().await.take();
    }
}

#[async_trait]
impl HandlerApi for Pipelined {
    fn config(&self) -> &Config {
        &self.config
    }

    fn context(&self) -> &ControllerContext {
        &self.context
    }

    fn tables(&self) -> &TableAllocator {
        &self.tables
    }

    fn versions(&self) -> &RuleVersionTracker {
        &self.versions
    }

    fn is_connected(&self) -> bool {
        self.flows.is_connected()
    }

    fn classifier(&self) -> &Classifier {
        &self.apps.classifier
    }

    fn ue_mac(&self) -> Option<&UeMacController> {
        self.apps.ue_mac.as_ref()
    }

    fn check_quota(&self) -> Option<&CheckQuotaController> {
        self.apps.check_quota.as_ref()
    }

    fn enforcement(&self, origin: RequestOrigin) -> Option<&EnforcementController> {
        match origin {
            RequestOrigin::Gx => self.apps.enforcement.as_ref(),
            RequestOrigin::Gy => self.apps.gy.as_ref(),
            RequestOrigin::Wildcard => None,
        }
    }

    fn enforcement_stats(&self) -> Option<&EnforcementStats> {
        self.apps.enforcement_stats.as_ref()
    }

    async fn install_default_flows(&self, logger: &Logger) -> Result<()> {
        self.apps.classifier.install_default_flows().await?;
        if let Some(ue_mac) = &self.apps.ue_mac {
            ue_mac.install_default_flows().await?;
        }
        if let Some(check_quota) = &self.apps.check_quota {
            check_quota.install_default_flows().await?;
        }
        if let Some(he) = &self.apps.he {
            he.install_default_flows().await?;
        }
        for enforcement in [&self.apps.gy, &self.apps.enforcement].into_iter().flatten() {
            enforcement.install_default_flows().await?;
        }
        if let Some(stats) = &self.apps.enforcement_stats {
            stats.install_default_flows().await?;
        }
        info!(logger, "Default flows installed");
        Ok(())
    }
}
