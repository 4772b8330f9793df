//! Batcher forwarding through a worker connection to the master.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use nodelink_batcher::{
        BatchResponder, BatchSink, Batcher, BatcherClient, BatcherConfig, EchoSink, HandlerSink,
        Message, MuxDemuxQueue, Result,
    };
    use nodelink_transport::{Command, TcpTransport};
    use serde_json::json;

    use crate::harness::TestCluster;

    /// Upper-cases every string event.
    struct Shout;

    #[async_trait]
    impl BatchSink for Shout {
        async fn process(&self, batch: Vec<Message>) -> Result<Vec<Message>> {
            Ok(batch
                .into_iter()
                .map(|m| {
                    let loud = m.msg.as_str().unwrap_or_default().to_uppercase();
                    Message::new(m.uid, json!(loud))
                })
                .collect())
        }
    }

    async fn cluster_with<S: BatchSink>(sink: S) -> TestCluster {
        TestCluster::start_with(TestCluster::server_config(), TcpTransport::default(), |s| {
            s.with_command(Command::BATCH, BatchResponder::new(sink))
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_events_round_trip_through_master() {
        let mut cluster = cluster_with(EchoSink).await;
        let worker = cluster.add_worker("worker-1").await.unwrap();

        let queue = Arc::new(MuxDemuxQueue::new());
        let config = BatcherConfig {
            max_elements: 4,
            max_time: Duration::from_millis(50),
            ..Default::default()
        };
        let batcher = Batcher::new(Arc::clone(&queue), config, HandlerSink::from_client(Arc::clone(&worker)));
        let running = tokio::spawn(batcher.run());

        let client = BatcherClient::new(Arc::clone(&queue));
        let ids: Vec<_> = (0..10)
            .map(|i| client.send_event(json!({ "id": "worker-1", "n": i })).unwrap())
            .collect();
        for (i, uid) in ids.iter().enumerate() {
            let response = client.get_response(*uid).await.unwrap();
            assert_eq!(response, json!({ "id": "worker-1", "n": i }));
            // Delivered once.
            assert_eq!(client.get_response(*uid).await, None);
        }

        queue.close();
        running.await.unwrap();
        cluster.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_master_sink_transforms_events() {
        let mut cluster = cluster_with(Shout).await;
        let worker = cluster.add_worker("worker-1").await.unwrap();

        let queue = Arc::new(MuxDemuxQueue::new());
        let config = BatcherConfig {
            max_time: Duration::from_millis(20),
            ..Default::default()
        };
        let _running = tokio::spawn(Batcher::new(Arc::clone(&queue), config, HandlerSink::from_client(worker)).run());

        let client = BatcherClient::new(Arc::clone(&queue));
        let uid = client.send_event("quiet please").unwrap();
        let response = client
            .get_response_timeout(uid, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(response, Some(json!("QUIET PLEASE")));

        cluster.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_master_without_batch_command_answers_errors() {
        let mut cluster = TestCluster::start().await.unwrap();
        let worker = cluster.add_worker("worker-1").await.unwrap();

        let queue = Arc::new(MuxDemuxQueue::new());
        let config = BatcherConfig {
            max_elements: 2,
            ..Default::default()
        };
        let _running = tokio::spawn(Batcher::new(Arc::clone(&queue), config, HandlerSink::from_client(worker)).run());

        let client = BatcherClient::new(Arc::clone(&queue));
        let a = client.send_event(1).unwrap();
        let b = client.send_event(2).unwrap();
        for uid in [a, b] {
            let response = client.get_response(uid).await.unwrap();
            assert!(response["error"].is_string(), "{}", response);
        }

        cluster.stop().await.unwrap();
    }
}
