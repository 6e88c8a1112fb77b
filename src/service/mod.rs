//! Partitioned grid service
//!
//! Wires the coordination core together for one service: the ownership
//! table and its distribution coordinator, the action policy, the guardian
//! and the connection load balancer. A running service consumes two feeds:
//! membership events and member load updates. Distribution runs after every
//! membership change and on a periodic tick.
//!
//! The coordination loop guards itself. If it stops heartbeating past the
//! guardian's hard timeout, the failure policy is told the service failed.

use crate::balancer::{self, admit, Admission, ClientInfo, ServiceLoad, ServiceLoadBalancer};
use crate::common::clock::{Clock, SystemClock};
use crate::common::config::Config;
use crate::common::hash::{HashPartitioning, KeyPartitioningStrategy};
use crate::common::member::{Member, MembershipEvent, PartitionId, ServiceContext};
use crate::common::{Error, Result};
use crate::guardian::{
    DefaultServiceFailurePolicy, FailableService, GuardContext, Guardable, Guardian,
    ServiceFailurePolicy,
};
use crate::partition::{
    CycleReport, DistributionCoordinator, GuidResolver, PartitionAssignmentStrategy,
    PartitionOwnershipTable, SimpleAssignmentStrategy,
};
use crate::policy::{
    Action, ActionPolicy, ClusterQuorumPolicy, CompositeActionPolicy, PartitionedQuorumPolicy,
    ProxyQuorumPolicy,
};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// A member's load as seen on the load feed; `None` withdraws the member
#[derive(Debug, Clone)]
pub struct LoadUpdate {
    pub member: Member,
    pub load: Option<ServiceLoad>,
}

pub struct GridServiceBuilder {
    config: Config,
    local: Member,
    strategy: Option<Arc<dyn PartitionAssignmentStrategy>>,
    policies: Vec<Arc<dyn ActionPolicy>>,
    failure_policy: Option<Arc<dyn ServiceFailurePolicy>>,
    balancer: Option<Arc<dyn ServiceLoadBalancer>>,
    partitioning: Option<Arc<dyn KeyPartitioningStrategy>>,
    resolver: Option<Arc<dyn GuidResolver>>,
    clock: Option<Arc<dyn Clock>>,
}

impl GridServiceBuilder {
    pub fn strategy(mut self, strategy: Arc<dyn PartitionAssignmentStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Add a policy on top of the configured quorum policies
    pub fn policy(mut self, policy: Arc<dyn ActionPolicy>) -> Self {
        self.policies.push(policy);
        self
    }

    pub fn failure_policy(mut self, policy: Arc<dyn ServiceFailurePolicy>) -> Self {
        self.failure_policy = Some(policy);
        self
    }

    pub fn balancer(mut self, balancer: Arc<dyn ServiceLoadBalancer>) -> Self {
        self.balancer = Some(balancer);
        self
    }

    pub fn partitioning(mut self, partitioning: Arc<dyn KeyPartitioningStrategy>) -> Self {
        self.partitioning = Some(partitioning);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn GuidResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<Arc<GridService>> {
        let config = self.config;
        config.validate()?;

        let quorum = &config.quorum;
        let mut policies: Vec<Arc<dyn ActionPolicy>> =
            vec![Arc::new(PartitionedQuorumPolicy::from_config(quorum))];
        if quorum.connect_quorum > 0 {
            policies.push(Arc::new(ProxyQuorumPolicy::new(quorum.connect_quorum)));
        }
        if !quorum.timeout_survivor_quorum.is_empty() {
            policies.push(Arc::new(ClusterQuorumPolicy::new(
                &quorum.timeout_survivor_quorum,
            )));
        }
        policies.extend(self.policies);
        let policy = CompositeActionPolicy::combine(policies);

        let table = Arc::new(PartitionOwnershipTable::new(
            config.partition.partition_count,
            config.partition.backup_count,
        ));
        let context = ServiceContext::new(config.service_name.clone()).with_local(self.local.clone());
        let mut coordinator = DistributionCoordinator::new(
            config.partition.clone(),
            table,
            self.strategy
                .unwrap_or_else(|| Arc::new(SimpleAssignmentStrategy::new())),
            policy,
            context,
        );
        if let Some(resolver) = self.resolver {
            coordinator = coordinator.with_resolver(resolver);
        }

        let failure_policy = self.failure_policy.unwrap_or_else(|| {
            Arc::new(DefaultServiceFailurePolicy::new(
                config.guardian.failure_policy,
            ))
        });
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock::new()));
        let guardian = Guardian::with_clock(config.guardian.clone(), failure_policy, clock);

        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(GridService {
            balancer: self
                .balancer
                .unwrap_or_else(|| balancer::from_order(config.balancer.order)),
            partitioning: self
                .partitioning
                .unwrap_or_else(|| Arc::new(HashPartitioning)),
            coordinator: Arc::new(coordinator),
            guardian: Arc::new(guardian),
            local: self.local,
            shutdown,
            running: AtomicBool::new(false),
            wake: Arc::new(Notify::new()),
            config,
        }))
    }
}

pub struct GridService {
    config: Config,
    local: Member,
    coordinator: Arc<DistributionCoordinator>,
    guardian: Arc<Guardian>,
    balancer: Arc<dyn ServiceLoadBalancer>,
    partitioning: Arc<dyn KeyPartitioningStrategy>,
    shutdown: watch::Sender<bool>,
    running: AtomicBool,
    wake: Arc<Notify>,
}

/// Tasks spawned by [`GridService::start`]
pub struct ServiceHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl ServiceHandle {
    /// Wait for every service task to finish
    pub async fn join(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Service task ended abnormally");
            }
        }
    }
}

/// Guardable wrapper for the coordination loop
struct CoordinationGuard {
    name: String,
    service: Weak<GridService>,
    wake: Arc<Notify>,
}

impl Guardable for CoordinationGuard {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn recover(&self) {
        self.wake.notify_one();
    }

    fn terminate(&self) {
        if let Some(service) = self.service.upgrade() {
            let guardian = Arc::clone(&service.guardian);
            guardian.service_failed(service);
        }
    }
}

impl GridService {
    pub fn builder(config: Config, local: Member) -> GridServiceBuilder {
        GridServiceBuilder {
            config,
            local,
            strategy: None,
            policies: Vec::new(),
            failure_policy: None,
            balancer: None,
            partitioning: None,
            resolver: None,
            clock: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn local_member(&self) -> &Member {
        &self.local
    }

    pub fn coordinator(&self) -> &Arc<DistributionCoordinator> {
        &self.coordinator
    }

    pub fn table(&self) -> &Arc<PartitionOwnershipTable> {
        self.coordinator.table()
    }

    pub fn guardian(&self) -> &Arc<Guardian> {
        &self.guardian
    }

    pub fn balancer(&self) -> &Arc<dyn ServiceLoadBalancer> {
        &self.balancer
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    // === Ownership queries ===

    pub fn owner_of(&self, partition: PartitionId) -> Option<Member> {
        self.table().owner_of(partition)
    }

    pub fn backup_owner_of(&self, partition: PartitionId, n: usize) -> Option<Member> {
        self.table().backup_owner_of(partition, n)
    }

    pub fn owned_partitions(&self, member: &Member, include_backups: bool) -> BTreeSet<PartitionId> {
        self.table().owned_partitions(member, include_backups)
    }

    pub fn partition_of(&self, key: &[u8]) -> PartitionId {
        self.partitioning
            .partition_of(key, self.config.partition.partition_count)
    }

    pub fn owner_of_key(&self, key: &[u8]) -> Option<Member> {
        self.owner_of(self.partition_of(key))
    }

    // === Policy gates ===

    pub fn is_allowed(&self, action: &Action) -> bool {
        self.coordinator.is_allowed(action)
    }

    pub fn check_allowed(&self, action: &Action) -> Result<()> {
        self.coordinator.check_allowed(action)
    }

    /// Gate a member asking to join the service
    pub fn admit_member(&self, member: &Member) -> Result<()> {
        self.check_allowed(&Action::MemberJoin).inspect_err(|_| {
            tracing::info!(member = %member, "Join refused by action policy");
        })
    }

    // === Connections ===

    pub fn member_list(&self, client: &ClientInfo) -> Option<Vec<Member>> {
        self.balancer.member_list(client)
    }

    /// Decide where a new client connection goes
    pub fn admit_connection(&self, client: &ClientInfo) -> Result<Admission> {
        self.check_allowed(&Action::Connect)?;
        Ok(admit(self.balancer.as_ref(), &self.local, client))
    }

    /// Publish the local member's load
    pub fn publish_load(&self, load: ServiceLoad) {
        self.balancer.update(&self.local, Some(load));
    }

    // === Distribution ===

    /// Apply a membership event and run a distribution cycle
    pub async fn handle_membership(&self, event: MembershipEvent) -> Result<CycleReport> {
        self.coordinator.on_membership_event(&event);
        if let MembershipEvent::Left(member) = &event {
            self.balancer.update(member, None);
        }
        self.coordinator.rebalance().await
    }

    pub async fn rebalance(&self) -> Result<CycleReport> {
        self.coordinator.rebalance().await
    }

    async fn run_cycle(&self) {
        match self.coordinator.rebalance().await {
            Ok(report) => {
                if report.recovered > 0 || report.moved > 0 {
                    tracing::info!(
                        recovered = report.recovered,
                        moved = report.moved,
                        in_flight = report.in_flight,
                        "Distribution cycle"
                    );
                }
            }
            Err(e) => tracing::warn!(error = %e, "Distribution cycle failed"),
        }
    }

    // === Lifecycle ===

    /// Start the guardian and the coordination loop
    pub fn start(
        self: &Arc<Self>,
        mut membership: mpsc::Receiver<MembershipEvent>,
        mut loads: mpsc::Receiver<LoadUpdate>,
    ) -> Result<ServiceHandle> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(Error::Internal(format!(
                "service {} already started",
                self.config.service_name
            )));
        }
        let _ = self.shutdown.send_replace(false);

        let mut tasks = vec![self.guardian.start()];

        let guard: Option<Arc<GuardContext>> = self.guardian.guard(Arc::new(CoordinationGuard {
            name: format!("{}-coordinator", self.config.service_name),
            service: Arc::downgrade(self),
            wake: Arc::clone(&self.wake),
        }))?;

        let service = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        let interval = Duration::from_millis(self.config.partition.distribution_interval_ms);
        tasks.push(tokio::spawn(async move {
            tracing::info!(service = %service.config.service_name, "Coordination loop started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut membership_open = true;
            let mut loads_open = true;

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    event = membership.recv(), if membership_open => match event {
                        Some(event) => {
                            service.coordinator.on_membership_event(&event);
                            if let MembershipEvent::Left(member) = &event {
                                service.balancer.update(member, None);
                            }
                            service.run_cycle().await;
                        }
                        None => membership_open = false,
                    },
                    update = loads.recv(), if loads_open => match update {
                        Some(update) => service.balancer.update(&update.member, update.load),
                        None => loads_open = false,
                    },
                    _ = ticker.tick() => service.run_cycle().await,
                    _ = service.wake.notified() => service.run_cycle().await,
                }
                if let Some(guard) = &guard {
                    guard.heartbeat();
                }
            }

            if let Some(guard) = guard {
                guard.release();
            }
            tracing::info!(service = %service.config.service_name, "Coordination loop stopped");
        }));

        tracing::info!(
            service = %self.config.service_name,
            member = %self.local,
            partitions = self.config.partition.partition_count,
            "Service started"
        );
        Ok(ServiceHandle { tasks })
    }

    /// Stop the coordination loop and the guardian
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown.send_replace(true);
        self.guardian.release_all();
        self.guardian.stop();
        tracing::info!(service = %self.config.service_name, "Service stopped");
    }
}

impl FailableService for GridService {
    fn service_name(&self) -> String {
        self.config.service_name.clone()
    }

    fn stop(&self) {
        GridService::stop(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::DenyAllPolicy;

    fn config() -> Config {
        let mut config = Config::default();
        config.partition.partition_count = 13;
        config
    }

    #[test]
    fn test_key_routing_uses_table() {
        let local = Member::new(1);
        let service = GridService::builder(config(), local.clone()).build().unwrap();
        assert!(service.owner_of_key(b"alpha").is_none());

        service.coordinator().run_cycle().unwrap();
        assert_eq!(service.owner_of_key(b"alpha"), Some(local));
        assert!(service.partition_of(b"alpha") < 13);
    }

    #[test]
    fn test_extra_policy_is_intersected() {
        let service = GridService::builder(config(), Member::new(1))
            .policy(Arc::new(DenyAllPolicy))
            .build()
            .unwrap();
        assert!(!service.is_allowed(&Action::Read));
        assert!(service.admit_member(&Member::new(2)).is_err());
        assert!(service.admit_connection(&ClientInfo::default()).is_err());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = config();
        config.partition.partition_count = 0;
        assert!(GridService::builder(config, Member::new(1)).build().is_err());
    }
}
