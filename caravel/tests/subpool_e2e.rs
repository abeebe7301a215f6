//! Sub-pool scenarios with in-process worker pools: placement stability,
//! forwarding through the main endpoint, sub-pool loss, backpressure.
//!
//! Worker pools normally run as child processes of the main; here they run
//! as tasks inside the test process through `PoolBuilder::launch_fn`,
//! which exercises the identical bootstrap, forwarding and heartbeat
//! paths over real unix sockets.

use caravel::pool::LaunchFn;
use caravel::prelude::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct Counter {
    value: i64,
}

#[derive(Serialize, Deserialize)]
struct Inc(i64);

#[derive(Serialize, Deserialize)]
struct GetValue;

#[derive(Serialize, Deserialize)]
struct SlowEcho {
    sleep_ms: u64,
    text: String,
}

#[async_trait]
impl<C: Codec> Actor<C> for Counter {
    const CLASS_ID: &'static str = "Counter";
    type Init = i64;

    async fn on_create(init: i64, _ctx: &ActorContext<C>) -> Result<Self> {
        Ok(Self { value: init })
    }

    fn register_handlers(table: &mut HandlerTable<Self, C>) {
        table.register::<Inc, i64>();
        table.register::<GetValue, i64>();
        table.register::<SlowEcho, String>();
    }
}

#[async_trait]
impl<C: Codec> Handler<Inc, i64, C> for Counter {
    async fn handle(&mut self, req: Inc, _ctx: &ActorContext<C>) -> Result<i64> {
        self.value += req.0;
        Ok(self.value)
    }
}

#[async_trait]
impl<C: Codec> Handler<GetValue, i64, C> for Counter {
    async fn handle(&mut self, _req: GetValue, _ctx: &ActorContext<C>) -> Result<i64> {
        Ok(self.value)
    }
}

#[async_trait]
impl<C: Codec> Handler<SlowEcho, String, C> for Counter {
    async fn handle(&mut self, req: SlowEcho, _ctx: &ActorContext<C>) -> Result<String> {
        tokio::time::sleep(Duration::from_millis(req.sleep_ms)).await;
        Ok(req.text)
    }
}

type SubPools = Arc<Mutex<HashMap<u32, Arc<Pool>>>>;

fn unix_addr(label: &str) -> String {
    format!(
        "unix://{}/caravel-sub-e2e-{}-{}.sock",
        std::env::temp_dir().display(),
        std::process::id(),
        label
    )
}

/// Launch sub-pools as in-process tasks, tracking their handles so tests
/// can kill them.
fn in_process_launcher(subs: SubPools) -> LaunchFn {
    Arc::new(move |index, endpoint, main| {
        let endpoint = endpoint.to_string();
        let main = main.to_string();
        let subs = subs.clone();
        tokio::spawn(async move {
            let built = Pool::builder()
                .address(&endpoint)
                .and_then(|b| b.sub_role(index, &main))
                .map(|b| b.register::<Counter>());
            match built {
                Ok(builder) => match builder.build().await {
                    Ok(pool) => {
                        let pool = Arc::new(pool);
                        subs.lock().unwrap().insert(index, pool.clone());
                        let _ = pool.run_until_shutdown().await;
                    }
                    Err(e) => tracing::error!(index, error = %e, "sub-pool build failed"),
                },
                Err(e) => tracing::error!(index, error = %e, "sub-pool config failed"),
            }
        });
        Ok(None)
    })
}

#[tokio::test]
async fn test_affinity_placement_survives_recreate() {
    let subs: SubPools = Arc::new(Mutex::new(HashMap::new()));
    let pool = Pool::builder()
        .address(&unix_addr("affinity"))
        .unwrap()
        .n_subpools(4)
        .allocation_policy(PlacementPolicy::Affinity)
        .launch_fn(in_process_launcher(subs.clone()))
        .register::<Counter>()
        .build()
        .await
        .unwrap();

    let k = pool
        .create_actor_with::<Counter>(&0, "k", Placement::Default)
        .await
        .unwrap();
    let first_index = k.address.subpool.expect("placed on a sub-pool");

    // Calls route through the main endpoint to the worker.
    let value: i64 = pool.call(&k, &Inc(4), Some(Duration::from_secs(5))).await.unwrap();
    assert_eq!(value, 4);

    // The index server reports the sub-pool address.
    let resolved = pool.resolve(pool.address(), "k").await.unwrap();
    assert_eq!(resolved.address.subpool, Some(first_index));

    // Destroy, then re-create under unchanged topology: same index, fresh
    // state.
    pool.destroy_actor(&k).await.unwrap();
    let k2 = pool
        .create_actor_with::<Counter>(&0, "k", Placement::Default)
        .await
        .unwrap();
    assert_eq!(k2.address.subpool, Some(first_index));
    let value: i64 = pool
        .call(&k2, &GetValue, Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(value, 0);

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_subpool_loss_fails_actors() {
    let subs: SubPools = Arc::new(Mutex::new(HashMap::new()));
    let pool = Pool::builder()
        .address(&unix_addr("loss"))
        .unwrap()
        .n_subpools(2)
        .heartbeat_interval(Duration::from_millis(100))
        .restart_policy(caravel::RestartPolicy::Never)
        .launch_fn(in_process_launcher(subs.clone()))
        .register::<Counter>()
        .build()
        .await
        .unwrap();

    let victim = pool
        .create_actor_with::<Counter>(&1, "victim", Placement::SubPool(1))
        .await
        .unwrap();
    assert_eq!(victim.address.subpool, Some(1));
    let value: i64 = pool
        .call(&victim, &GetValue, Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(value, 1);

    // Kill sub-pool 1; its channels close and the supervisor's sweep
    // notices within a heartbeat window.
    let sub = subs.lock().unwrap().get(&1).cloned().expect("sub-pool 1 up");
    sub.shutdown().await.unwrap();

    let mut lost = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let result: Result<i64> = pool
            .call(&victim, &GetValue, Some(Duration::from_secs(1)))
            .await;
        match result {
            Err(PoolError::SubPoolLost(_)) => {
                lost = true;
                break;
            }
            // Until the sweep runs, the send fails with a transport error.
            Err(_) => continue,
            Ok(_) => panic!("call succeeded against a dead sub-pool"),
        }
    }
    assert!(lost, "actor was never reported as SubPoolLost");

    // New placements on the dead slot are refused too.
    let result = pool
        .create_actor_with::<Counter>(&0, "replacement", Placement::SubPool(1))
        .await;
    assert!(matches!(result, Err(PoolError::SubPoolLost(_))));

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_backpressure_against_slow_receiver() {
    let addr_a = unix_addr("bp-a");
    let addr_b = unix_addr("bp-b");

    let pool_a = Pool::builder()
        .address(&addr_a)
        .unwrap()
        .high_water_envelopes(2)
        .build()
        .await
        .unwrap();
    let pool_b = Pool::builder()
        .address(&addr_b)
        .unwrap()
        .register::<Counter>()
        .build()
        .await
        .unwrap();

    let slow = pool_b
        .create_actor_with::<Counter>(&0, "slow", Placement::Main)
        .await
        .unwrap();

    let pool_a = Arc::new(pool_a);
    let mut calls = Vec::new();
    for i in 0..5 {
        let pool_a = pool_a.clone();
        let slow = slow.clone();
        calls.push(tokio::spawn(async move {
            pool_a
                .call::<SlowEcho, String>(
                    &slow,
                    &SlowEcho {
                        sleep_ms: 1_000,
                        text: format!("m{i}"),
                    },
                    Some(Duration::from_millis(50)),
                )
                .await
        }));
    }

    let mut replies = 0;
    let mut rejected = 0;
    for call in calls {
        match call.await.unwrap() {
            Ok(_) => replies += 1,
            Err(PoolError::Backpressure(_)) | Err(PoolError::Timeout(_)) => rejected += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert!(rejected >= 3, "rejected={rejected} replies={replies}");
    assert!(replies <= 2, "replies={replies}");

    pool_a.shutdown().await.unwrap();
    pool_b.shutdown().await.unwrap();
}
