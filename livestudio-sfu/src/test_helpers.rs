//! Fakes shared by unit tests

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;

use crate::error::Result;
use crate::loopback::default_capabilities;
use crate::protocol::{
    ClientRequest, ConsumerOptions, Direction, Joined, MediaKind, ParticipantInfo, ServerReply,
    TransportOptions,
};
use crate::rtp::{DtlsParameters, DtlsRole, IceParameters, RtpParameters};
use crate::signaling::SignalingChannel;
use crate::types::{ConsumerId, ProducerId, SocketId, TransportId};

pub const LOCAL_SOCKET: &str = "local";

#[derive(Default)]
struct Script {
    requests: Vec<ClientRequest>,
    posts: Vec<ClientRequest>,
    rejections: HashMap<&'static str, String>,
    holds: HashMap<&'static str, Arc<Notify>>,
    roster: Vec<ParticipantInfo>,
    produced: usize,
}

/// Signaling channel answering every request with a canned reply.
///
/// Producer ids are `p1`, `p2`, ... in produce order; consumer ids are
/// `c-<producer id>`; the local socket id is [`LOCAL_SOCKET`].
#[derive(Default)]
pub struct ScriptedSignaling {
    script: Mutex<Script>,
}

impl ScriptedSignaling {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Participants returned in the `joined` reply
    pub fn with_roster(self: Arc<Self>, roster: Vec<ParticipantInfo>) -> Arc<Self> {
        self.script.lock().roster = roster;
        self
    }

    /// Answer every `name` request with `rejected`
    pub fn reject(&self, name: &'static str, reason: &str) {
        self.script.lock().rejections.insert(name, reason.to_string());
    }

    pub fn allow(&self, name: &'static str) {
        self.script.lock().rejections.remove(name);
    }

    /// Park the next `name` request until the returned handle is notified
    pub fn hold(&self, name: &'static str) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.script.lock().holds.insert(name, Arc::clone(&notify));
        notify
    }

    /// Awaited requests named `name`
    pub fn count(&self, name: &str) -> usize {
        self.script
            .lock()
            .requests
            .iter()
            .filter(|r| r.name() == name)
            .count()
    }

    /// Fire-and-forget requests named `name`
    pub fn posted(&self, name: &str) -> usize {
        self.script
            .lock()
            .posts
            .iter()
            .filter(|r| r.name() == name)
            .count()
    }

    pub fn posts(&self) -> Vec<ClientRequest> {
        self.script.lock().posts.clone()
    }

    pub fn last_request(&self, name: &str) -> Option<ClientRequest> {
        self.script
            .lock()
            .requests
            .iter()
            .rev()
            .find(|r| r.name() == name)
            .cloned()
    }

    fn reply(script: &mut Script, request: &ClientRequest) -> ServerReply {
        if let Some(reason) = script.rejections.get(request.name()) {
            return ServerReply::Rejected {
                reason: reason.clone(),
            };
        }
        match request {
            ClientRequest::JoinRoom(_) => ServerReply::Joined(Joined {
                socket_id: SocketId::from(LOCAL_SOCKET),
                router_rtp_capabilities: default_capabilities(),
                participants: script.roster.clone(),
            }),
            ClientRequest::CreateTransport { direction } => {
                ServerReply::TransportCreated(transport_options(*direction))
            }
            ClientRequest::Produce { .. } => {
                script.produced += 1;
                ServerReply::Produced {
                    producer_id: ProducerId::new(format!("p{}", script.produced)),
                }
            }
            ClientRequest::Consume { producer_id, .. } => ServerReply::Consumed(ConsumerOptions {
                id: ConsumerId::new(format!("c-{producer_id}")),
                producer_id: producer_id.clone(),
                kind: MediaKind::Video,
                rtp_parameters: RtpParameters::default(),
            }),
            _ => ServerReply::Ack,
        }
    }
}

fn transport_options(direction: Direction) -> TransportOptions {
    TransportOptions {
        id: TransportId::new(format!("{direction}-transport")),
        ice_parameters: IceParameters {
            username_fragment: "ufrag".to_string(),
            password: "pwd".to_string(),
            ice_lite: true,
        },
        ice_candidates: Vec::new(),
        dtls_parameters: DtlsParameters {
            role: DtlsRole::Auto,
            fingerprints: Vec::new(),
        },
    }
}

#[async_trait]
impl SignalingChannel for ScriptedSignaling {
    async fn request(&self, request: ClientRequest) -> Result<ServerReply> {
        let hold = {
            let mut script = self.script.lock();
            script.requests.push(request.clone());
            script.holds.remove(request.name())
        };
        if let Some(notify) = hold {
            notify.notified().await;
        } else {
            tokio::task::yield_now().await;
        }
        let mut script = self.script.lock();
        Ok(Self::reply(&mut script, &request))
    }

    fn post(&self, request: ClientRequest) {
        self.script.lock().posts.push(request);
    }
}

/// Yield to other tasks until `condition` holds
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}
