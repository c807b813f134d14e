//! Shared test doubles.

use std::sync::Mutex as StdMutex;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::binary::Node;
use crate::conn::{ConnError, NodeSender};

type Responder = Box<dyn Fn(&Node) -> Option<Node> + Send + Sync>;

/// A recording `NodeSender` with scripted query replies. A responder is
/// keyed by a marker: it fires when the queried node carries a child with
/// that tag (or is itself tagged with it).
#[derive(Default)]
pub struct MockSender {
    sent: StdMutex<Vec<Node>>,
    queried: StdMutex<Vec<Node>>,
    responders: StdMutex<Vec<(String, Responder)>>,
}

impl MockSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond_to<F>(&self, marker: &str, f: F)
    where
        F: Fn(&Node) -> Option<Node> + Send + Sync + 'static,
    {
        self.responders
            .lock()
            .unwrap()
            .push((marker.to_string(), Box::new(f)));
    }

    pub fn sent(&self) -> Vec<Node> {
        self.sent.lock().unwrap().clone()
    }

    pub fn queried(&self) -> Vec<Node> {
        self.queried.lock().unwrap().clone()
    }
}

impl NodeSender for MockSender {
    fn send_node(&self, node: Node) -> BoxFuture<'_, Result<(), ConnError>> {
        self.sent.lock().unwrap().push(node);
        Box::pin(async { Ok(()) })
    }

    fn query(
        &self,
        node: Node,
        _timeout: Option<Duration>,
    ) -> BoxFuture<'_, Result<Node, ConnError>> {
        self.queried.lock().unwrap().push(node.clone());
        let responders = self.responders.lock().unwrap();
        for (marker, responder) in responders.iter() {
            let matches = node.tag == *marker || node.get_child_by_tag(marker).is_some();
            if matches {
                if let Some(reply) = responder(&node) {
                    return Box::pin(async move { Ok(reply) });
                }
            }
        }
        Box::pin(async {
            Err(ConnError::Iq {
                code: 0,
                text: "no mock responder".into(),
            })
        })
    }
}
