//! The node crate's master and worker builders wired together.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use nodelink_node::config::{NodeConfig, NodeType};
    use nodelink_node::master::build_server;
    use nodelink_node::worker::{batcher_config, build_client, send_batch_events};
    use nodelink_transport::MainTask;

    use crate::harness::{wait_connected, TestEnv};

    #[tokio::test]
    async fn test_config_file_drives_master_and_worker() {
        let env = TestEnv::new("config_file_drives_master_and_worker").unwrap();
        let path = env
            .write_file(
                "master.toml",
                br#"
name = "master-a"
node_type = "master"
bind_addr = "127.0.0.1"
port = 0
key = "0123456789abcdef0123456789abcdef"
"#,
            )
            .unwrap();
        let master_config = NodeConfig::from_file(&path).unwrap();
        let server = Arc::new(build_server(&master_config).unwrap());
        let listener = server.bind().await.unwrap();
        let port: u16 = listener
            .local_addr()
            .unwrap()
            .rsplit_once(':')
            .unwrap()
            .1
            .parse()
            .unwrap();
        let serving = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.serve(listener).await })
        };

        let worker_config = NodeConfig {
            name: "worker-a".to_string(),
            node_type: NodeType::Worker,
            port,
            batch_max_time_ms: 20,
            ..master_config.clone()
        };
        let manager = Arc::new(build_client(&worker_config, MainTask::Idle).unwrap());
        let running = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.run().await })
        };
        assert!(wait_connected(&manager, Duration::from_secs(5)).await);
        assert_eq!(manager.handler().unwrap().peer_name().as_deref(), Some("master-a"));
        assert_eq!(server.clients()[0].name, "worker-a");

        let answered = send_batch_events(Arc::clone(&manager), batcher_config(&worker_config), 7).await;
        assert_eq!(answered, 7);

        manager.shutdown();
        running.await.unwrap().unwrap();
        server.shutdown();
        serving.await.unwrap().unwrap();
    }
}
