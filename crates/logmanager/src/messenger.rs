use async_trait::async_trait;
use edge_scheduler_core::{SchedulerError, SchedulerResult};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// 边缘节点的对端信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub ip: String,
    pub sn: String,
}

/// 下发给边缘节点的日志导出请求
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DumpLogRequest {
    pub module: String,
    pub task_id: String,
}

impl DumpLogRequest {
    pub const MODULE_EDGE_NODE: &'static str = "edgeNode";

    pub fn for_task(task_id: impl Into<String>) -> Self {
        Self {
            module: Self::MODULE_EDGE_NODE.to_string(),
            task_id: task_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeDumpMessage {
    pub node_id: u64,
    pub peer: PeerInfo,
    pub request: DumpLogRequest,
}

/// 与边缘节点通信的端口
#[async_trait]
pub trait EdgeMessenger: Send + Sync {
    async fn send_dump_request(&self, message: EdgeDumpMessage) -> SchedulerResult<()>;
}

/// 基于通道的实现，由上层的消息总线消费
#[derive(Debug, Clone)]
pub struct ChannelEdgeMessenger {
    tx: mpsc::Sender<EdgeDumpMessage>,
}

impl ChannelEdgeMessenger {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<EdgeDumpMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EdgeMessenger for ChannelEdgeMessenger {
    async fn send_dump_request(&self, message: EdgeDumpMessage) -> SchedulerResult<()> {
        self.tx
            .send(message)
            .await
            .map_err(|e| SchedulerError::Internal(format!("边缘消息通道已关闭: {}", e.0.peer.sn)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let request = DumpLogRequest::for_task("dumpSingleNodeLog.sn1.abc");
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"module": "edgeNode", "taskId": "dumpSingleNodeLog.sn1.abc"})
        );
    }

    #[tokio::test]
    async fn test_channel_messenger() {
        let (messenger, mut rx) = ChannelEdgeMessenger::new(1);
        let message = EdgeDumpMessage {
            node_id: 7,
            peer: PeerInfo {
                ip: "10.0.0.7".to_string(),
                sn: "sn7".to_string(),
            },
            request: DumpLogRequest::for_task("dumpSingleNodeLog.sn7.x"),
        };
        messenger.send_dump_request(message.clone()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), message);

        drop(rx);
        assert!(messenger.send_dump_request(message).await.is_err());
    }
}
