mod common;

use std::sync::Arc;

use common::{mux, MockRuntime};
use dockerbridge::orchestrator::{data_container_name, Orchestrator, OrchestratorConfig};
use dockerbridge::runtime::ContainerRuntime;

fn orchestrator(rt: Arc<MockRuntime>) -> Orchestrator {
    Orchestrator::new(rt as Arc<dyn ContainerRuntime>, OrchestratorConfig::default())
}

#[test]
fn test_ensure_common_infrastructure_bootstraps_once() {
    let rt = MockRuntime::new();
    let orch = orchestrator(rt.clone());

    assert!(orch.ensure_common_infrastructure());
    let names = rt.container_names();
    assert!(names.contains(&"knowledge_data".to_string()));
    assert!(names.contains(&"mongo_data".to_string()));
    assert!(names.contains(&"mongo_db".to_string()));

    // The database data container is created but never started.
    {
        let st = rt.state.lock().unwrap();
        let mongo_data = st.containers.iter().find(|c| c.name == "mongo_data").unwrap();
        assert!(!mongo_data.running);
        let mongo = st.containers.iter().find(|c| c.name == "mongo_db").unwrap();
        assert!(mongo.running);
        // mongo_db mounts the data container's volume
        let (_, opts) = st
            .started
            .iter()
            .find(|(name, _)| name == "mongo_db")
            .unwrap();
        assert_eq!(opts.volumes_from, vec!["mongo_data".to_string()]);
    }

    // Second call is a no-op: same container count, no further creates.
    let creates_before = rt
        .calls()
        .iter()
        .filter(|c| c.starts_with("create"))
        .count();
    assert!(orch.ensure_common_infrastructure());
    let creates_after = rt
        .calls()
        .iter()
        .filter(|c| c.starts_with("create"))
        .count();
    assert_eq!(creates_before, creates_after);
}

#[test]
fn test_create_user_data_container_is_idempotent() {
    let rt = MockRuntime::new();
    let orch = orchestrator(rt.clone());

    assert!(orch.create_user_data_container("alice"));
    assert!(orch.create_user_data_container("alice"));

    let names = rt.container_names();
    let data_containers: Vec<_> = names.iter().filter(|n| *n == "data_alice").collect();
    assert_eq!(data_containers.len(), 1);

    let st = rt.state.lock().unwrap();
    let spec = st
        .created
        .iter()
        .find(|s| s.name.as_deref() == Some("data_alice"))
        .unwrap();
    assert_eq!(spec.volumes, vec!["/home/ros/user_data".to_string()]);
    assert_eq!(spec.image, "knowrob/user_data");
    assert_eq!(spec.entrypoint, Some(vec!["true".to_string()]));
}

#[test]
fn test_start_user_container_restarts_not_duplicates() {
    let rt = MockRuntime::with_containers(&[("alice", "knowrob/app")]);
    let orch = orchestrator(rt.clone());

    assert!(orch.start_user_container("alice", "knowrob/app", &[], &[]));

    // The pre-existing container was stopped and removed before the create.
    let calls = rt.calls();
    let stop_idx = calls.iter().position(|c| c == "stop alice").unwrap();
    let remove_idx = calls.iter().position(|c| c == "remove alice").unwrap();
    let create_idx = calls.iter().position(|c| c == "create alice").unwrap();
    assert!(stop_idx < remove_idx && remove_idx < create_idx);

    let alices: Vec<_> = rt
        .container_names()
        .into_iter()
        .filter(|n| n == "alice")
        .collect();
    assert_eq!(alices.len(), 1);
}

#[test]
fn test_start_user_container_wiring() {
    let rt = MockRuntime::new();
    let orch = orchestrator(rt.clone());

    let links = vec!["mongo_db:mongo".to_string()];
    let volumes = vec!["extra_volume".to_string()];
    assert!(orch.start_user_container("alice", "knowrob/app", &links, &volumes));

    let st = rt.state.lock().unwrap();
    let spec = st
        .created
        .iter()
        .find(|s| s.name.as_deref() == Some("alice"))
        .unwrap();
    let env: std::collections::HashMap<_, _> = spec.env.iter().cloned().collect();
    assert_eq!(env.get("VIRTUAL_HOST").map(String::as_str), Some("alice"));
    assert_eq!(env.get("VIRTUAL_PORT").map(String::as_str), Some("9090"));
    let package_path = env.get("ROS_PACKAGE_PATH").unwrap();
    assert!(package_path.ends_with("/home/ros/user_data"));
    assert!(package_path.contains("/home/ros/src"));

    let (_, opts) = st.started.iter().find(|(name, _)| name == "alice").unwrap();
    assert_eq!(opts.links, links);
    assert!(opts
        .volumes_from
        .contains(&data_container_name("alice")));
    assert!(opts.volumes_from.contains(&"knowledge_data".to_string()));
    assert!(opts.volumes_from.contains(&"extra_volume".to_string()));
    assert_eq!(opts.port_bindings.len(), 1);
    assert_eq!(opts.port_bindings[0].container_port, 9090);
    assert_eq!(opts.port_bindings[0].host_ip, "127.0.0.1");
}

#[test]
fn test_start_webapp_container_is_create_if_absent() {
    let rt = MockRuntime::with_containers(&[("webapp", "knowrob/webapp")]);
    let orch = orchestrator(rt.clone());

    assert!(orch.start_webapp_container("webapp", "knowrob/webapp", &[], &[]));
    // No restart: the existing container was left alone.
    assert!(!rt.calls().iter().any(|c| c == "stop webapp"));
    assert!(!rt.calls().iter().any(|c| c == "create webapp"));
}

#[test]
fn test_stop_container_is_noop_when_absent() {
    let rt = MockRuntime::new();
    let orch = orchestrator(rt.clone());

    assert!(orch.stop_container("ghost"));
    assert!(!rt.calls().iter().any(|c| c.starts_with("stop ")));
}

#[test]
fn test_container_exists_matches_exact_names_only() {
    let rt = MockRuntime::with_containers(&[("foo", "img"), ("foo2", "img")]);
    let orch = orchestrator(rt.clone());

    assert!(orch.container_exists("foo"));
    assert!(orch.container_exists("foo2"));
    assert!(!orch.container_exists("fo"));
    assert!(!orch.container_exists("foo22"));
}

#[test]
fn test_container_exists_with_image() {
    let rt = MockRuntime::with_containers(&[("alice", "knowrob/app")]);
    let orch = orchestrator(rt.clone());

    assert!(orch.container_exists_with_image("alice", "knowrob/app"));
    assert!(!orch.container_exists_with_image("alice", "other/image"));
    assert!(!orch.container_exists_with_image("ghost", "knowrob/app"));
}

#[test]
fn test_get_container_ip_sentinel_on_failure() {
    let rt = MockRuntime::with_containers(&[("alice", "img")]);
    let orch = orchestrator(rt.clone());

    assert_eq!(orch.get_container_ip("alice"), "172.17.0.23");
    assert_eq!(orch.get_container_ip("ghost"), "error");
}

#[test]
fn test_get_container_log_demultiplexes_in_order() {
    let rt = MockRuntime::with_containers(&[("alice", "img")]);
    {
        let mut st = rt.state.lock().unwrap();
        st.log_output.insert(
            "alice".to_string(),
            mux(&[(1, b"out1\n"), (2, b"err1\n"), (1, b"out2\n")]),
        );
    }
    let orch = orchestrator(rt.clone());
    assert_eq!(orch.get_container_log("alice"), "out1\nerr1\nout2\n");
    assert_eq!(orch.get_container_log("ghost"), "error");
}

#[test]
fn test_get_container_log_caps_and_marks_truncation() {
    let rt = MockRuntime::with_containers(&[("alice", "img")]);
    let long = vec![b'x'; 4096];
    {
        let mut st = rt.state.lock().unwrap();
        st.log_output
            .insert("alice".to_string(), mux(&[(1, &long)]));
    }
    let mut config = OrchestratorConfig::default();
    config.max_log_bytes = 100;
    let orch = Orchestrator::new(rt as Arc<dyn ContainerRuntime>, config);
    let log = orch.get_container_log("alice");
    assert!(log.ends_with("\n[log truncated]\n"));
    assert!(log.starts_with("xxxx"));
    assert_eq!(log.len(), 100 + "\n[log truncated]\n".len());
}
