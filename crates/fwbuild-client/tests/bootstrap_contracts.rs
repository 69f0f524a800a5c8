use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use fwbuild_client::{ensure_coordinator, BootstrapOptions};
use fwbuild_config::CoordinatorConfig;
use tempfile::TempDir;

async fn start_stub_coordinator() -> SocketAddr {
    let app = Router::new().route(
        "/api/daemon/status",
        get(|| async { axum::Json(serde_json::json!({"pid": std::process::id()})) }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind stub");
    let addr = listener.local_addr().expect("stub addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve stub");
    });
    addr
}

fn publish_port(config: &CoordinatorConfig, port: u16) {
    std::fs::create_dir_all(&config.state_dir).expect("state dir");
    std::fs::write(config.port_file(), format!("{port}\n")).expect("port file");
}

fn unused_options() -> BootstrapOptions {
    // Never spawned in these tests; `false` fails fast if it ever is.
    BootstrapOptions {
        daemon_argv: vec!["false".to_owned()],
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn bootstrap_accepts_an_already_live_coordinator() {
    let root = TempDir::new().expect("tempdir");
    let config = CoordinatorConfig::for_testing(root.path(), 0);
    let addr = start_stub_coordinator().await;
    publish_port(&config, addr.port());

    let resolved = tokio::task::spawn_blocking({
        let config = config.clone();
        move || ensure_coordinator(&config, &unused_options())
    })
    .await
    .expect("join")
    .expect("bootstrap succeeds");
    assert_eq!(resolved, addr.port());
}

#[tokio::test(flavor = "multi_thread")]
async fn ten_concurrent_clients_reach_the_same_coordinator() {
    let root = TempDir::new().expect("tempdir");
    let config = CoordinatorConfig::for_testing(root.path(), 0);
    let addr = start_stub_coordinator().await;
    publish_port(&config, addr.port());

    let config = Arc::new(config);
    let mut clients = Vec::new();
    for _ in 0..10 {
        let client_config = Arc::clone(&config);
        clients.push(tokio::task::spawn_blocking(move || {
            ensure_coordinator(&client_config, &unused_options())
        }));
    }

    for client in clients {
        let resolved = client.await.expect("join").expect("bootstrap succeeds");
        assert_eq!(resolved, addr.port(), "all clients see one coordinator");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn spawner_waits_for_the_coordinator_it_started() {
    let root = TempDir::new().expect("tempdir");
    let config = CoordinatorConfig::for_testing(root.path(), 0);
    let addr = start_stub_coordinator().await;

    // The "daemon" publishes the stub's port after a startup delay, like a
    // real coordinator binding and then writing its port file.
    std::fs::create_dir_all(&config.state_dir).expect("state dir");
    let options = BootstrapOptions {
        daemon_argv: vec![
            "sh".to_owned(),
            "-c".to_owned(),
            format!(
                "sleep 0.3; echo {} > {}",
                addr.port(),
                config.port_file().display()
            ),
        ],
    };

    let resolved = tokio::task::spawn_blocking({
        let config = config.clone();
        move || ensure_coordinator(&config, &options)
    })
    .await
    .expect("join")
    .expect("spawn-and-wait succeeds");
    assert_eq!(resolved, addr.port());

    let spawn_log =
        std::fs::read_to_string(config.spawn_log_file()).expect("spawn log written");
    assert!(spawn_log.contains("spawn attempt 1"));
}
