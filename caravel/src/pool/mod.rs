//! Pool supervision: launching, monitoring and restarting sub-process
//! worker pools, and routing by sub-pool index.
//!
//! A pool is one main process plus N sub-processes on the same host. The
//! main process owns the public endpoint; actors placed on sub-pools are
//! addressed as `<main>/subpool/<i>` and the main process forwards their
//! traffic over internal unix-socket channels. Sub-pool state is never
//! reconstituted after a crash; clients re-create.

pub mod placement;

use crate::actor::cell::Completion;
use crate::config::{PoolConfig, RestartPolicy};
use crate::error::{PoolError, Result};
use crate::router::Router;
use bytes::Bytes;
use caravel_transport::control::RegistryReport;
use caravel_transport::{
    ActorUid, Address, ControlPayload, Envelope, EnvelopeKind, ErrorPayload, Scheme,
};
use placement::{Allocator, Placement, PlacementPolicy};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::sync::Notify;

/// Observed state of one sub-pool slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubPoolState {
    Starting,
    Up,
    Down,
}

struct SubPoolSlot {
    endpoint: Address,
    state: SubPoolState,
    child: Option<Child>,
    /// Last heartbeat-piggybacked registry view.
    loads: HashMap<ActorUid, u64>,
}

/// How the supervisor launches one sub-pool process.
///
/// The default respawns the current executable with the `sub` subcommand;
/// tests inject in-process launchers instead.
pub type LaunchFn = Arc<dyn Fn(u32, &Address, &Address) -> Result<Option<Child>> + Send + Sync>;

/// Supervisor for the sub-process worker pools behind one main process.
pub struct Supervisor {
    main_address: Address,
    router: Arc<Router>,
    policy: PlacementPolicy,
    restart: RestartPolicy,
    graceful_deadline: Duration,
    allocator: Allocator,
    slots: Mutex<Vec<SubPoolSlot>>,
    /// uid → sub-pool index. Assignments are stable for the actor's
    /// lifetime.
    actor_index: Mutex<HashMap<ActorUid, u32>>,
    /// uids that went down with their sub-pool and were deregistered.
    lost: Mutex<HashMap<ActorUid, u32>>,
    ready_notify: Notify,
    launch: LaunchFn,
}

impl Supervisor {
    pub fn new(
        config: &PoolConfig,
        router: Arc<Router>,
        launch: Option<LaunchFn>,
    ) -> Result<Arc<Self>> {
        if config.n_subpools == 0 {
            return Err(PoolError::Internal(
                "supervisor requires n_subpools > 0".into(),
            ));
        }
        if config.address.scheme == Scheme::Inproc {
            return Err(PoolError::ProtocolError(
                "inproc pools cannot host sub-processes".into(),
            ));
        }

        let main_address = config.address.clone();
        let launch = launch.unwrap_or_else(|| Arc::new(spawn_subprocess));
        let slots = (0..config.n_subpools)
            .map(|index| {
                Ok(SubPoolSlot {
                    endpoint: sub_endpoint(&main_address, index)?,
                    state: SubPoolState::Starting,
                    child: None,
                    loads: HashMap::new(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Arc::new(Self {
            main_address,
            router,
            policy: config.allocation_policy,
            restart: config.restart_policy,
            graceful_deadline: config.graceful_deadline,
            allocator: Allocator::new(config.n_subpools),
            slots: Mutex::new(slots),
            actor_index: Mutex::new(HashMap::new()),
            lost: Mutex::new(HashMap::new()),
            ready_notify: Notify::new(),
            launch,
        }))
    }

    pub fn n_subpools(&self) -> u32 {
        self.allocator.n()
    }

    /// Logical address of sub-pool `index`: the main endpoint narrowed.
    pub fn logical_address(&self, index: u32) -> Address {
        self.main_address.with_subpool(index)
    }

    /// Internal endpoint the sub-process binds.
    pub fn endpoint(&self, index: u32) -> Option<Address> {
        self.slots
            .lock()
            .expect("slots poisoned")
            .get(index as usize)
            .map(|s| s.endpoint.clone())
    }

    /// Launch every sub-process and wait until all report ready.
    pub async fn start(self: &Arc<Self>, ready_deadline: Duration) -> Result<()> {
        for index in 0..self.n_subpools() {
            self.launch_slot(index)?;
        }

        let deadline = Instant::now() + ready_deadline;
        loop {
            if self.all_up() {
                tracing::info!(n = self.n_subpools(), "all sub-pools up");
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(PoolError::SubPoolLost(
                    "sub-pools failed to report ready before the deadline".into(),
                ));
            }
            let _ = tokio::time::timeout(deadline - now, self.ready_notify.notified()).await;
        }
    }

    fn launch_slot(&self, index: u32) -> Result<()> {
        let endpoint = self
            .endpoint(index)
            .ok_or_else(|| PoolError::Internal(format!("no slot {index}")))?;
        tracing::info!(index, endpoint = %endpoint, "launching sub-pool");
        let child = (self.launch)(index, &endpoint, &self.main_address)?;
        let mut slots = self.slots.lock().expect("slots poisoned");
        let slot = &mut slots[index as usize];
        slot.child = child;
        slot.state = SubPoolState::Starting;
        Ok(())
    }

    /// A sub-pool finished bootstrapping and registered its channel.
    pub fn mark_ready(&self, index: u32) {
        if let Some(slot) = self
            .slots
            .lock()
            .expect("slots poisoned")
            .get_mut(index as usize)
        {
            slot.state = SubPoolState::Up;
            tracing::info!(index, "sub-pool ready");
        }
        self.ready_notify.notify_waiters();
    }

    /// Fold a heartbeat-piggybacked registry view into the load table.
    pub fn update_report(&self, report: RegistryReport) {
        if let Some(slot) = self
            .slots
            .lock()
            .expect("slots poisoned")
            .get_mut(report.subpool as usize)
        {
            slot.loads = report
                .actors
                .into_iter()
                .map(|a| (a.uid, a.inbox_len))
                .collect();
        }
    }

    pub fn state(&self, index: u32) -> Option<SubPoolState> {
        self.slots
            .lock()
            .expect("slots poisoned")
            .get(index as usize)
            .map(|s| s.state)
    }

    /// Choose (and record) the sub-pool for a new actor.
    ///
    /// `None` means the main process hosts it. An existing assignment for
    /// the uid is returned unchanged: a sub-pool index is stable for the
    /// lifetime of an actor once assigned.
    pub fn allocate(&self, uid: &ActorUid, placement: &Placement) -> Result<Option<u32>> {
        if matches!(placement, Placement::Main) {
            return Ok(None);
        }

        let mut index_map = self.actor_index.lock().expect("actor index poisoned");
        if let Some(existing) = index_map.get(uid) {
            return Ok(Some(*existing));
        }

        let index = match placement {
            Placement::Main => unreachable!("handled above"),
            Placement::SubPool(i) => {
                if *i >= self.n_subpools() {
                    return Err(PoolError::ProtocolError(format!(
                        "sub-pool index {i} out of range (n={})",
                        self.n_subpools()
                    )));
                }
                *i
            }
            Placement::RoundRobin => self.allocator.round_robin(),
            Placement::LeastLoaded => self.allocator.least_loaded(&self.slot_loads()),
            Placement::Affinity(key) => self.allocator.affinity(key),
            Placement::Default => match self.policy {
                PlacementPolicy::RoundRobin => self.allocator.round_robin(),
                PlacementPolicy::LeastLoaded => self.allocator.least_loaded(&self.slot_loads()),
                PlacementPolicy::Affinity => self.allocator.affinity(uid.as_bytes()),
            },
        };

        index_map.insert(uid.clone(), index);
        self.lost.lock().expect("lost poisoned").remove(uid);
        Ok(Some(index))
    }

    /// Forget an assignment after a successful destroy.
    pub fn release(&self, uid: &ActorUid) {
        self.actor_index
            .lock()
            .expect("actor index poisoned")
            .remove(uid);
    }

    /// Where a uid lives, if it was placed on a sub-pool.
    pub fn index_of(&self, uid: &ActorUid) -> Option<u32> {
        self.actor_index
            .lock()
            .expect("actor index poisoned")
            .get(uid)
            .copied()
    }

    /// Whether a uid was deregistered because its sub-pool died.
    pub fn is_lost(&self, uid: &ActorUid) -> bool {
        self.lost.lock().expect("lost poisoned").contains_key(uid)
    }

    fn slot_loads(&self) -> Vec<u64> {
        self.slots
            .lock()
            .expect("slots poisoned")
            .iter()
            .map(|s| s.loads.values().sum())
            .collect()
    }

    fn all_up(&self) -> bool {
        self.slots
            .lock()
            .expect("slots poisoned")
            .iter()
            .all(|s| s.state == SubPoolState::Up)
    }

    /// Forward a request envelope to the sub-pool its destination names.
    pub(crate) async fn forward(&self, envelope: Envelope, completion: Option<Completion>) {
        let index = match envelope.to.address.subpool {
            Some(index) => index,
            None => {
                if let Some(c) = completion {
                    c.resolve(Err(PoolError::Internal(
                        "forward without a sub-pool index".into(),
                    )));
                }
                return;
            }
        };

        match self.state(index) {
            Some(SubPoolState::Up) => {}
            Some(_) | None => {
                if let Some(c) = completion {
                    c.resolve(Err(PoolError::SubPoolLost(format!(
                        "sub-pool {index} is not up"
                    ))));
                }
                return;
            }
        }
        let endpoint = match self.endpoint(index) {
            Some(endpoint) => endpoint,
            None => return,
        };

        let deadline = envelope.remaining();
        let is_send = envelope.kind == EnvelopeKind::Send;
        let result: Result<Bytes> = async {
            let channel = self.router.channel_to(&endpoint).await?;
            if is_send {
                let reply = channel
                    .request(envelope, deadline)
                    .await
                    .map_err(PoolError::from)?;
                match reply.kind {
                    EnvelopeKind::Reply => Ok(reply.payload),
                    EnvelopeKind::Error => Err(ErrorPayload::decode(&reply.payload).into()),
                    other => Err(PoolError::ProtocolError(format!(
                        "unexpected forward reply kind {other:?}"
                    ))),
                }
            } else {
                channel.send(envelope, false).await.map_err(PoolError::from)?;
                Ok(Bytes::new())
            }
        }
        .await;

        if let Some(c) = completion {
            c.resolve(result);
        }
    }

    /// Periodic failure detection: a sub-pool whose control channel closed
    /// (two missed heartbeats) is marked down, its actors are failed and
    /// deregistered, and the process is restarted when the policy says so.
    ///
    /// Returns the uids lost in this sweep.
    pub fn sweep(self: &Arc<Self>) -> Vec<ActorUid> {
        let mut lost_now = Vec::new();
        let down_indexes: Vec<u32> = {
            let mut slots = self.slots.lock().expect("slots poisoned");
            let mut down = Vec::new();
            for (i, slot) in slots.iter_mut().enumerate() {
                if slot.state == SubPoolState::Up && !self.router.peer_open(&slot.endpoint) {
                    slot.state = SubPoolState::Down;
                    slot.loads.clear();
                    down.push(i as u32);
                }
            }
            down
        };

        for index in down_indexes {
            tracing::warn!(index, "sub-pool down");
            // Deregister every actor hosted there. State is gone; clients
            // re-create.
            let mut index_map = self.actor_index.lock().expect("actor index poisoned");
            let uids: Vec<ActorUid> = index_map
                .iter()
                .filter(|(_, i)| **i == index)
                .map(|(uid, _)| uid.clone())
                .collect();
            let mut lost = self.lost.lock().expect("lost poisoned");
            for uid in &uids {
                index_map.remove(uid);
                lost.insert(uid.clone(), index);
            }
            drop(lost);
            drop(index_map);
            lost_now.extend(uids);

            if self.restart == RestartPolicy::OnFailure {
                if let Err(e) = self.launch_slot(index) {
                    tracing::error!(index, error = %e, "sub-pool restart failed");
                }
            }
        }
        lost_now
    }

    /// Graceful shutdown: broadcast drain, wait out the deadline, then
    /// kill whatever is left. Returns `true` when force-kill was needed.
    pub async fn shutdown(&self) -> bool {
        let endpoints: Vec<(u32, Address)> = {
            let slots = self.slots.lock().expect("slots poisoned");
            slots
                .iter()
                .enumerate()
                .filter(|(_, s)| s.state == SubPoolState::Up)
                .map(|(i, s)| (i as u32, s.endpoint.clone()))
                .collect()
        };

        for (index, endpoint) in &endpoints {
            if let Some(channel) = self.router.channel_snapshot(endpoint) {
                let drain = Envelope::control(
                    channel.next_id(),
                    caravel_transport::ActorRef::control(endpoint.clone()),
                    ControlPayload::DrainPool.encode(),
                );
                if let Err(e) = channel.send(drain, false).await {
                    tracing::debug!(index = *index, error = %e, "drain broadcast failed");
                }
            }
        }

        let mut children: Vec<(u32, Child)> = {
            let mut slots = self.slots.lock().expect("slots poisoned");
            slots
                .iter_mut()
                .enumerate()
                .filter_map(|(i, s)| s.child.take().map(|c| (i as u32, c)))
                .collect()
        };

        let deadline = Instant::now() + self.graceful_deadline;
        let mut forced = false;
        for (index, child) in &mut children {
            let now = Instant::now();
            let budget = if now < deadline {
                deadline - now
            } else {
                Duration::ZERO
            };
            match tokio::time::timeout(budget, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::info!(index = *index, %status, "sub-pool exited");
                }
                Ok(Err(e)) => {
                    tracing::warn!(index = *index, error = %e, "sub-pool wait failed");
                }
                Err(_) => {
                    tracing::warn!(index = *index, "sub-pool did not drain, killing");
                    forced = true;
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
        }
        forced
    }
}

/// Internal endpoint for sub-pool `index` behind `main`.
///
/// Sub-pools share the host with their main process, so the internal
/// control/data path is always a unix socket regardless of the public
/// scheme.
pub fn sub_endpoint(main: &Address, index: u32) -> Result<Address> {
    match main.scheme {
        Scheme::Unix => Ok(Address {
            scheme: Scheme::Unix,
            host: format!("{}.sub{index}", main.host),
            port: None,
            subpool: None,
        }),
        Scheme::Tcp | Scheme::Ucx => {
            let dir = std::env::temp_dir();
            let port = main.port.unwrap_or(0);
            Ok(Address {
                scheme: Scheme::Unix,
                host: dir
                    .join(format!("caravel-{port}-sub{index}.sock"))
                    .to_string_lossy()
                    .into_owned(),
                port: None,
                subpool: None,
            })
        }
        Scheme::Inproc => Err(PoolError::ProtocolError(
            "inproc pools cannot host sub-processes".into(),
        )),
    }
}

/// Default launcher: re-run the current executable's `sub` subcommand.
fn spawn_subprocess(index: u32, endpoint: &Address, main: &Address) -> Result<Option<Child>> {
    let exe = std::env::current_exe()
        .map_err(|e| PoolError::Internal(format!("current_exe: {e}")))?;
    let child = Command::new(exe)
        .arg("sub")
        .arg("--address")
        .arg(endpoint.to_string())
        .arg("--main-address")
        .arg(main.to_string())
        .arg("--index")
        .arg(index.to_string())
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| PoolError::Internal(format!("spawn sub-pool {index}: {e}")))?;
    Ok(Some(child))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::router::RouterConfig;
    use caravel_transport::{ChannelConfig, DriverSet};
    use tokio::sync::mpsc;

    fn test_supervisor(n: u32, policy: PlacementPolicy) -> Arc<Supervisor> {
        let address = Address::parse("unix:///tmp/caravel-sup-test.sock").unwrap();
        let mut config = PoolConfig::new(address.clone());
        config.n_subpools = n;
        config.allocation_policy = policy;

        let (sink_tx, _sink_rx) = mpsc::unbounded_channel();
        let router = Router::new(
            address,
            DriverSet::standard(),
            RouterConfig {
                channel: ChannelConfig::default(),
                reconnect: Default::default(),
            },
            sink_tx,
        );
        // No processes are launched in unit tests.
        let launch: LaunchFn = Arc::new(|_, _, _| Ok(None));
        Supervisor::new(&config, router, Some(launch)).unwrap()
    }

    #[test]
    fn test_affinity_assignment_is_stable() {
        let sup = test_supervisor(4, PlacementPolicy::Affinity);
        let uid = ActorUid::from("k");

        let first = sup.allocate(&uid, &Placement::Default).unwrap().unwrap();
        // Re-query while the actor exists: unchanged.
        assert_eq!(sup.allocate(&uid, &Placement::Default).unwrap(), Some(first));

        // Destroy and re-create under unchanged topology: same index.
        sup.release(&uid);
        let second = sup.allocate(&uid, &Placement::Default).unwrap().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_round_robin_spreads() {
        let sup = test_supervisor(3, PlacementPolicy::RoundRobin);
        let picks: Vec<u32> = (0..3)
            .map(|i| {
                sup.allocate(&ActorUid::from(format!("a{i}").as_str()), &Placement::Default)
                    .unwrap()
                    .unwrap()
            })
            .collect();
        assert_eq!(picks, vec![0, 1, 2]);
    }

    #[test]
    fn test_explicit_placements() {
        let sup = test_supervisor(2, PlacementPolicy::RoundRobin);
        assert_eq!(
            sup.allocate(&ActorUid::from("m"), &Placement::Main).unwrap(),
            None
        );
        assert_eq!(
            sup.allocate(&ActorUid::from("p"), &Placement::SubPool(1))
                .unwrap(),
            Some(1)
        );
        assert!(sup
            .allocate(&ActorUid::from("q"), &Placement::SubPool(9))
            .is_err());
    }

    #[test]
    fn test_least_loaded_uses_reports() {
        let sup = test_supervisor(2, PlacementPolicy::LeastLoaded);
        sup.mark_ready(0);
        sup.mark_ready(1);
        sup.update_report(RegistryReport {
            subpool: 0,
            actors: vec![caravel_transport::control::ActorLoad {
                uid: ActorUid::from("busy"),
                inbox_len: 10,
            }],
        });
        sup.update_report(RegistryReport {
            subpool: 1,
            actors: vec![],
        });
        let pick = sup
            .allocate(&ActorUid::from("new"), &Placement::Default)
            .unwrap();
        assert_eq!(pick, Some(1));
    }

    #[test]
    fn test_sub_endpoint_derivation() {
        let unix_main = Address::parse("unix:///tmp/a.sock").unwrap();
        let ep = sub_endpoint(&unix_main, 2).unwrap();
        assert_eq!(ep.to_string(), "unix:///tmp/a.sock.sub2");

        let tcp_main = Address::parse("tcp://10.0.0.1:9000").unwrap();
        let ep = sub_endpoint(&tcp_main, 0).unwrap();
        assert_eq!(ep.scheme, Scheme::Unix);
        assert!(ep.host.contains("caravel-9000-sub0"));

        let inproc_main = Address::parse("inproc://p").unwrap();
        assert!(sub_endpoint(&inproc_main, 0).is_err());
    }

    #[test]
    fn test_sweep_marks_lost_actors() {
        let sup = test_supervisor(2, PlacementPolicy::RoundRobin);
        sup.mark_ready(0);
        sup.mark_ready(1);
        let uid = ActorUid::from("v");
        let idx = sup.allocate(&uid, &Placement::Default).unwrap().unwrap();

        // No channel to the sub endpoint exists, so the sweep sees the
        // sub-pool as unreachable.
        let lost = sup.sweep();
        assert!(lost.contains(&uid));
        assert_eq!(sup.state(idx), Some(SubPoolState::Down));
        assert!(sup.is_lost(&uid));
        assert_eq!(sup.index_of(&uid), None);
    }
}
