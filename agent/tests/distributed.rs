//! Cluster completo en un proceso: broker + dos agentes que lanzan el
//! binario `flow-executor` real, manejados por el driver distribuido.

use agent::ProcessLauncher;
use common::{
    rpc::BrokerClient,
    wordcount::{join_graph, wordcount_graph},
    AgentConfig, AgentRegisterRequest, BrokerConfig, FlowGraph, FlowStatus, HeartbeatRequest,
    OpKind, PartitionerSpec, Persistence, Resource, ResourceReport, RunConfig, SourceSpec,
    StepArtifact, StepOptions, StepRegistry,
};
use serde_json::json;
use std::{env, path::PathBuf, sync::Arc, time::Duration};
use tokio::net::TcpListener;

fn temp_dir(sub: &str) -> PathBuf {
    let dir = env::temp_dir().join(format!("flow-cluster-{}-{}", sub, uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn broker_config() -> BrokerConfig {
    BrokerConfig {
        heartbeat_interval: Duration::from_millis(100),
        ..BrokerConfig::default()
    }
}

async fn spawn_broker() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let broker_url = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(broker::serve(listener, broker_config()));
    broker_url
}

async fn spawn_agent(broker_url: &str, storage: PathBuf, capacity: Resource) -> agent::AgentServer {
    let config = AgentConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        data_bind_addr: "127.0.0.1:0".to_string(),
        broker_url: broker_url.to_string(),
        storage_dir: storage,
        capacity,
        heartbeat_interval: Duration::from_millis(100),
        executor_bin: PathBuf::from(env!("CARGO_BIN_EXE_flow-executor")),
        ..AgentConfig::default()
    };
    let launcher = Arc::new(ProcessLauncher::new(config.executor_bin.clone()));
    agent::start(config, launcher).await.unwrap()
}

/// Espera hasta que el broker vea `n` agentes vivos.
async fn wait_for_agents(broker_url: &str, n: usize) {
    let client = BrokerClient::new(broker_url);
    for _ in 0..100 {
        if let Ok(list) = client.list_agents().await {
            if list.iter().filter(|a| !a.dead).count() == n {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("los agentes no se registraron");
}

/// Levanta broker y un agente por capacidad; devuelve la URL del broker.
async fn cluster_with(sub: &str, capacities: &[Resource]) -> (String, Vec<PathBuf>) {
    let broker_url = spawn_broker().await;
    let mut dirs = Vec::new();
    for (i, capacity) in capacities.iter().enumerate() {
        let storage = temp_dir(&format!("{sub}-a{i}"));
        spawn_agent(&broker_url, storage.clone(), *capacity).await;
        dirs.push(storage);
    }
    wait_for_agents(&broker_url, capacities.len()).await;
    (broker_url, dirs)
}

async fn cluster(sub: &str, agents: usize) -> (String, Vec<PathBuf>) {
    cluster_with(sub, &vec![Resource::new(8, 8192, 0); agents]).await
}

fn run_config(spill: PathBuf) -> RunConfig {
    RunConfig {
        spill_dir: spill,
        poll_interval: Duration::from_millis(20),
        allocation_backoff: Duration::from_millis(50),
        region_retry_backoff: Duration::from_millis(100),
        task_timeout: Duration::from_secs(30),
        ..RunConfig::default()
    }
}

fn cleanup(dirs: Vec<PathBuf>) {
    for d in dirs {
        let _ = std::fs::remove_dir_all(d);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn wordcount_distribuido_coincide_con_local() {
    let (broker_url, mut dirs) = cluster("wc", 2).await;
    let source = SourceSpec::inline(vec![
        vec![b"el perro y el gato".to_vec(), b"Gato!".to_vec()],
        vec![b"un perro".to_vec()],
        vec![b"el fin".to_vec()],
    ]);
    let (g, out) = wordcount_graph(source, 2).unwrap();

    let remote_spill = temp_dir("wc-d");
    let remote = driver::run_distributed(&g, &broker_url, &run_config(remote_spill.clone()))
        .await
        .unwrap();
    dirs.push(remote_spill);
    assert_eq!(remote.status, FlowStatus::Succeeded, "{:?}", remote.failure);

    let spill = temp_dir("wc-l");
    let local = driver::run_local(&g, Arc::new(StepRegistry::with_builtins()), &run_config(spill.clone()))
        .await
        .unwrap();
    dirs.push(spill);

    assert_eq!(remote.outputs, local.outputs);
    let mut values = remote.json_records(out).unwrap();
    values.sort_by_key(|v| v["token"].as_str().unwrap().to_string());
    assert_eq!(values[0], json!({"token": "el", "count": 3}));
    cleanup(dirs);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn join_distribuido_lee_particiones_persistidas() {
    let (broker_url, mut dirs) = cluster("join", 2).await;
    let rec = |v: serde_json::Value| serde_json::to_vec(&v).unwrap();
    let left = SourceSpec::inline(vec![
        vec![rec(json!({"id": 1, "l": "a"}))],
        vec![rec(json!({"id": 2, "l": "b"}))],
    ]);
    let right = SourceSpec::inline(vec![
        vec![rec(json!({"rid": 2, "r": "x"}))],
        vec![rec(json!({"rid": 3, "r": "y"}))],
    ]);
    let (g, out) = join_graph(left, right, "id", "rid", 3).unwrap();

    let spill = temp_dir("join-d");
    let outcome = driver::run_distributed(&g, &broker_url, &run_config(spill.clone()))
        .await
        .unwrap();
    dirs.push(spill);

    assert!(outcome.succeeded(), "{:?}", outcome.failure);
    assert_eq!(
        outcome.json_records(out).unwrap(),
        vec![json!({"id": 2, "l": "b", "r": "x"})]
    );
    assert_eq!(outcome.stats.failed_runs, 0);
    cleanup(dirs);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn join_con_lado_izquierdo_lento_no_pierde_el_derecho() {
    let (broker_url, mut dirs) = cluster("late", 2).await;
    let rec = |v: serde_json::Value| serde_json::to_vec(&v).unwrap();

    let mut g = FlowGraph::new("late-join");
    let left = g
        .add_source(
            "left",
            SourceSpec::inline(vec![(0..5)
                .map(|i| rec(json!({"id": i, "l": "a"})))
                .collect()]),
            Persistence::Memory,
        )
        .unwrap();
    let right = g
        .add_source(
            "right",
            SourceSpec::inline(vec![vec![rec(json!({"rid": 2, "r": "x"}))]]),
            Persistence::Memory,
        )
        .unwrap();
    let map = |g: &mut FlowGraph, input: common::DatasetId, logic: StepArtifact, name: &str| {
        g.add_step_with(
            &[input],
            OpKind::Map,
            PartitionerSpec::None,
            logic,
            StepOptions::default().named(name),
        )
        .unwrap()
    };
    // el join termina de leer la izquierda mucho después del linger
    let slow = map(
        &mut g,
        left,
        StepArtifact::process("while read l; do sleep 0.3; echo \"$l\"; done"),
        "slow",
    );
    let lp = map(&mut g, slow, StepArtifact::native("parse_json"), "parse_left");
    let rp = map(&mut g, right, StepArtifact::native("parse_json"), "parse_right");
    let out = g
        .add_step_with(
            &[lp, rp],
            OpKind::Join,
            PartitionerSpec::Hash {
                keys: vec!["id".to_string(), "rid".to_string()],
            },
            StepArtifact::native_with("join", json!({"left_key": "id", "right_key": "rid"})),
            StepOptions::partitions(1).named("join"),
        )
        .unwrap();

    let spill = temp_dir("late-d");
    let mut config = run_config(spill.clone());
    config.shuffle.linger_timeout_ms = 200;
    let outcome = driver::run_distributed(&g, &broker_url, &config).await.unwrap();
    dirs.push(spill);

    assert!(outcome.succeeded(), "{:?}", outcome.failure);
    assert_eq!(
        outcome.json_records(out).unwrap(),
        vec![json!({"id": 2, "l": "a", "r": "x"})]
    );
    assert_eq!(outcome.stats.failed_runs, 0);
    cleanup(dirs);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn region_mas_ancha_que_el_cluster_corre_por_etapas() {
    // 4 slots en total; la región tiene 3 tareas de map y 6 de reduce
    let small = Resource::new(2, 8192, 0);
    let (broker_url, mut dirs) = cluster_with("wide", &[small, small]).await;
    let source = SourceSpec::inline(vec![
        vec![b"a b c".to_vec()],
        vec![b"b c d".to_vec()],
        vec![b"c d e".to_vec(), b"a".to_vec()],
    ]);
    let (g, out) = wordcount_graph(source, 6).unwrap();

    let spill = temp_dir("wide-d");
    let mut config = run_config(spill.clone());
    config.allocation_retries = 1;
    let remote = driver::run_distributed(&g, &broker_url, &config).await.unwrap();
    dirs.push(spill);
    assert!(remote.succeeded(), "{:?}", remote.failure);
    assert_eq!(remote.stats.failed_runs, 0);

    let spill = temp_dir("wide-l");
    let local = driver::run_local(&g, Arc::new(StepRegistry::with_builtins()), &run_config(spill.clone()))
        .await
        .unwrap();
    dirs.push(spill);
    assert_eq!(remote.outputs, local.outputs);

    let mut values = remote.json_records(out).unwrap();
    values.sort_by_key(|v| v["token"].as_str().unwrap().to_string());
    assert_eq!(values.len(), 5);
    assert_eq!(values[2], json!({"token": "c", "count": 3}));

    // toda la capacidad vuelve al broker
    let client = BrokerClient::new(&broker_url);
    let free: u32 = client
        .list_agents()
        .await
        .unwrap()
        .iter()
        .map(|a| a.free.slots)
        .sum();
    assert_eq!(free, 4);
    cleanup(dirs);
}

/// Registra en el broker un agente que no existe, con más capacidad que la
/// real y apuntando a `target`; lo mantiene vivo con heartbeats.
async fn register_ghost(broker_url: &str, target: &agent::AgentServer, capacity: Resource) {
    let client = BrokerClient::new(broker_url);
    let report = ResourceReport::idle(capacity);
    let resp = client
        .register(&AgentRegisterRequest {
            address: target.url.clone(),
            data_addr: target.data_addr.clone(),
            hostname: "ghost".to_string(),
            resource: report,
        })
        .await
        .unwrap();
    tokio::spawn(async move {
        loop {
            let _ = client
                .heartbeat(&HeartbeatRequest {
                    agent_id: resp.agent_id.clone(),
                    resource: report,
                })
                .await;
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    });
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rechazo_por_capacidad_reubica_la_tarea_sin_gastar_intentos() {
    let (broker_url, mut dirs) = cluster("refuse", 1).await;

    // agente real de 1 slot, registrado en otro broker: el principal sólo lo
    // conoce a través del fantasma, que anuncia 9 slots
    let other_broker = spawn_broker().await;
    let storage = temp_dir("refuse-real");
    let real = spawn_agent(&other_broker, storage.clone(), Resource::new(1, 8192, 0)).await;
    dirs.push(storage);
    register_ghost(&broker_url, &real, Resource::new(9, 8192, 0)).await;
    wait_for_agents(&broker_url, 2).await;

    let rec = |v: serde_json::Value| serde_json::to_vec(&v).unwrap();
    let left = SourceSpec::inline(vec![
        vec![rec(json!({"id": 1, "l": "a"}))],
        vec![rec(json!({"id": 2, "l": "b"}))],
    ]);
    let right = SourceSpec::inline(vec![
        vec![rec(json!({"rid": 2, "r": "x"}))],
        vec![rec(json!({"rid": 3, "r": "y"}))],
    ]);
    let (g, out) = join_graph(left, right, "id", "rid", 3).unwrap();

    let spill = temp_dir("refuse-d");
    let outcome = driver::run_distributed(&g, &broker_url, &run_config(spill.clone()))
        .await
        .unwrap();
    dirs.push(spill);

    assert!(outcome.succeeded(), "{:?}", outcome.failure);
    assert_eq!(
        outcome.json_records(out).unwrap(),
        vec![json!({"id": 2, "l": "b", "r": "x"})]
    );
    assert_eq!(outcome.stats.failed_runs, 0);
    cleanup(dirs);
}

/// Id que el broker le dio al agente, una vez que el agente lo recibió.
async fn registered_id(agent: &agent::AgentServer) -> String {
    for _ in 0..200 {
        if let Some(id) = agent.state.agent_id() {
            return id;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("el agente no se registró");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn agente_se_vuelve_a_registrar_tras_reiniciar_el_broker() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let broker_url = format!("http://{addr}");
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let first = tokio::spawn(broker::serve_with_shutdown(listener, broker_config(), async move {
        let _ = stop_rx.await;
    }));

    let storage = temp_dir("restart-a0");
    let agent = spawn_agent(&broker_url, storage.clone(), Resource::new(2, 1024, 0)).await;
    let before = registered_id(&agent).await;

    stop_tx.send(()).unwrap();
    first.await.unwrap().unwrap();

    // broker nuevo en la misma dirección, sin registro de agentes
    let listener = TcpListener::bind(addr).await.unwrap();
    tokio::spawn(broker::serve(listener, broker_config()));
    wait_for_agents(&broker_url, 1).await;

    let list = BrokerClient::new(&broker_url).list_agents().await.unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].address, agent.url);
    assert_ne!(list[0].agent_id, before);
    for _ in 0..100 {
        if agent.state.agent_id().as_deref() == Some(list[0].agent_id.as_str()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(agent.state.agent_id(), Some(list[0].agent_id.clone()));

    agent.shutdown().await;
    cleanup(vec![storage]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn agente_caido_a_mitad_del_flow_se_recupera_recomputando() {
    let broker_url = spawn_broker().await;
    let mut dirs = Vec::new();
    let mut agents = Vec::new();
    for i in 0..2 {
        let storage = temp_dir(&format!("crash-a{i}"));
        agents.push(spawn_agent(&broker_url, storage.clone(), Resource::new(8, 8192, 0)).await);
        dirs.push(storage);
    }
    wait_for_agents(&broker_url, 2).await;

    let rec = |v: serde_json::Value| serde_json::to_vec(&v).unwrap();
    let mut g = FlowGraph::new("crash");
    // lado derecho persistido en una región propia, una partición por agente
    let right = g
        .add_source(
            "right",
            SourceSpec::inline(vec![
                vec![rec(json!({"rid": 1, "r": "x"}))],
                vec![rec(json!({"rid": 2, "r": "y"}))],
            ]),
            Persistence::OnDisk,
        )
        .unwrap();
    let left = g
        .add_source(
            "left",
            SourceSpec::inline(vec![(0..4).map(|i| rec(json!({"id": i, "l": "a"}))).collect()]),
            Persistence::Memory,
        )
        .unwrap();
    let slow = g
        .add_step_with(
            &[left],
            OpKind::Map,
            PartitionerSpec::None,
            StepArtifact::process("while read l; do sleep 0.5; echo \"$l\"; done"),
            StepOptions::default().named("slow"),
        )
        .unwrap();
    let lp = g
        .add_step_with(
            &[slow],
            OpKind::Map,
            PartitionerSpec::None,
            StepArtifact::native("parse_json"),
            StepOptions::default().named("parse_left"),
        )
        .unwrap();
    let rp = g
        .add_step_with(
            &[right],
            OpKind::Map,
            PartitionerSpec::None,
            StepArtifact::native("parse_json"),
            StepOptions::default().named("parse_right"),
        )
        .unwrap();
    let out = g
        .add_step_with(
            &[lp, rp],
            OpKind::Join,
            PartitionerSpec::Hash {
                keys: vec!["id".to_string(), "rid".to_string()],
            },
            StepArtifact::native_with("join", json!({"left_key": "id", "right_key": "rid"})),
            StepOptions::partitions(1).named("join"),
        )
        .unwrap();

    let spill = temp_dir("crash-d");
    let mut config = run_config(spill.clone());
    config.max_task_attempts = 5;
    dirs.push(spill);
    let flow = {
        let g = g.clone();
        let broker_url = broker_url.clone();
        tokio::spawn(async move { driver::run_distributed(&g, &broker_url, &config).await })
    };

    // la cadena lenta (fusionada en el dataset de parse_left) marca que la
    // región persistida ya terminó; se apaga el agente que la corre
    let slow_task = common::task_id(lp, 0);
    let victim = 'found: loop {
        for (i, a) in agents.iter().enumerate() {
            let running = agent::state::lock(&a.state.executors)
                .values()
                .any(|r| r.handle.task_id == slow_task && r.is_running());
            if running {
                break 'found i;
            }
        }
        assert!(!flow.is_finished(), "el flow terminó antes de la caída");
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    agents.swap_remove(victim).shutdown().await;

    let outcome = tokio::time::timeout(Duration::from_secs(60), flow)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(outcome.succeeded(), "{:?}", outcome.failure);
    let mut joined = outcome.json_records(out).unwrap();
    joined.sort_by_key(|v| v["id"].as_i64());
    assert_eq!(
        joined,
        vec![
            json!({"id": 1, "l": "a", "r": "x"}),
            json!({"id": 2, "l": "a", "r": "y"}),
        ]
    );
    assert!(outcome.stats.recomputed_regions > 0, "{:?}", outcome.stats);
    assert!(outcome.stats.failed_runs > 0);
    cleanup(dirs);
}
