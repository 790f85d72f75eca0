//! Studio session
//!
//! [`Session`] owns every piece of per-mount protocol state: the capability
//! negotiator, the two transports, the producer and consumer registries, the
//! participant directory and guest admission. User actions are async methods;
//! server pushes go through [`Session::handle_event`] or [`Session::run`].
//!
//! State sits behind a single mutex that is never held across an await. Every
//! async operation records the session generation before suspending and
//! re-validates it afterwards; teardown bumps the generation so late results
//! from a previous join are discarded instead of applied.

use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::admission::{AdmissionState, GuestAdmission};
use crate::config::SessionConfig;
use crate::consumer::{Admission, ConsumerLedger, RemoteConsumer};
use crate::device::CapabilityNegotiator;
use crate::directory::ParticipantDirectory;
use crate::error::{Error, Result};
use crate::media::{LocalTrack, MediaCapture, MediaEngine};
use crate::presentation::{ParticipantView, SessionPhase, StudioNotice, StudioSnapshot};
use crate::producer::{LocalProducer, ProducerRegistry};
use crate::protocol::{
    ClientRequest, Direction, GuestRequest, JoinRoom, NewProducer, ParticipantInfo, Role,
    ServerEvent, SourceKind,
};
use crate::rtp::{MediaKind, RtpCapabilities};
use crate::signaling::{Signaling, SignalingChannel};
use crate::transport::Transport;
use crate::types::{ConsumerId, ProducerId, SocketId};

struct StudioState {
    phase: SessionPhase,
    generation: u64,
    local_socket_id: Option<SocketId>,
    negotiator: CapabilityNegotiator,
    send_transport: Option<Arc<Transport>>,
    recv_transport: Option<Arc<Transport>>,
    producers: ProducerRegistry,
    ledger: ConsumerLedger,
    directory: ParticipantDirectory,
    admission: GuestAdmission,
    admission_state: AdmissionState,
    /// Issued by the host on approval, presented on join
    join_token: Option<String>,
    /// Parent of every track-ended watcher of the current generation
    watchers: CancellationToken,
}

impl StudioState {
    fn new() -> Self {
        Self {
            phase: SessionPhase::Idle,
            generation: 0,
            local_socket_id: None,
            negotiator: CapabilityNegotiator::new(),
            send_transport: None,
            recv_transport: None,
            producers: ProducerRegistry::new(),
            ledger: ConsumerLedger::new(),
            directory: ParticipantDirectory::new(),
            admission: GuestAdmission::new(),
            admission_state: AdmissionState::Idle,
            join_token: None,
            watchers: CancellationToken::new(),
        }
    }

    fn is_local(&self, socket_id: &SocketId) -> bool {
        self.local_socket_id.as_ref() == Some(socket_id)
    }

    /// Consumption can start: joined, device loaded, receive transport up
    fn can_consume(&self) -> bool {
        self.phase == SessionPhase::Joined
            && self.negotiator.is_loaded()
            && self.recv_transport.is_some()
    }

    /// Stop the local producers, returning the close requests to post
    fn drain_producers(&mut self) -> Vec<ClientRequest> {
        let mut posts = Vec::new();
        for producer in self.producers.drain() {
            producer.retire();
            if let Some(transport) = &self.send_transport {
                transport.stop_sending(producer.track.id());
            }
            // A closing producer already has its close request in flight
            if !producer.is_closing() {
                posts.push(ClientRequest::CloseProducer {
                    producer_id: producer.id,
                });
            }
        }
        posts
    }

    /// Release everything owned by the current join and invalidate every
    /// operation still in flight. Returns the close requests to post.
    fn teardown(&mut self) -> Vec<ClientRequest> {
        self.generation += 1;
        self.watchers.cancel();
        self.watchers = CancellationToken::new();

        let mut posts = self.drain_producers();
        for consumer in self.directory.drain_consumers() {
            consumer.close();
            posts.push(ClientRequest::CloseConsumer {
                consumer_id: consumer.id,
            });
        }
        self.ledger.clear();

        let transports = [self.send_transport.take(), self.recv_transport.take()];
        for transport in transports.into_iter().flatten() {
            if transport.close() {
                posts.push(ClientRequest::CloseTransport {
                    transport_id: transport.id().clone(),
                });
            }
        }

        self.negotiator.reset();
        self.admission.clear();
        self.local_socket_id = None;
        posts
    }
}

/// Everything a consume needs, captured when the producer was admitted
struct ConsumeJob {
    generation: u64,
    transport: Arc<Transport>,
    capabilities: RtpCapabilities,
    producer: NewProducer,
}

struct SessionInner {
    config: SessionConfig,
    signaling: RwLock<Signaling>,
    engine: Arc<dyn MediaEngine>,
    capture: Arc<dyn MediaCapture>,
    state: Mutex<StudioState>,
    notices: broadcast::Sender<StudioNotice>,
    shutdown: CancellationToken,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.phase == SessionPhase::Left {
            return;
        }
        let posts = state.teardown();
        let signaling = self.signaling.get_mut();
        for request in posts {
            signaling.post(request);
        }
    }
}

/// Handle to one studio session. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub fn new(
        config: SessionConfig,
        channel: Arc<dyn SignalingChannel>,
        engine: Arc<dyn MediaEngine>,
        capture: Arc<dyn MediaCapture>,
    ) -> Self {
        let (notices, _) = broadcast::channel(config.notice_capacity.max(1));
        Self {
            inner: Arc::new(SessionInner {
                config,
                signaling: RwLock::new(Signaling::new(channel)),
                engine,
                capture,
                state: Mutex::new(StudioState::new()),
                notices,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Receive UI notices from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StudioNotice> {
        self.inner.notices.subscribe()
    }

    fn signaling(&self) -> Signaling {
        self.inner.signaling.read().clone()
    }

    fn notify(&self, notice: StudioNotice) {
        // Nobody listening is fine
        let _ = self.inner.notices.send(notice);
    }

    fn post_all(&self, requests: Vec<ClientRequest>) {
        if requests.is_empty() {
            return;
        }
        let signaling = self.signaling();
        for request in requests {
            signaling.post(request);
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.inner.state.lock().generation == generation
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Join the room: load capabilities, then create both transports.
    ///
    /// Any failure tears the partial state down and is returned as
    /// [`Error::JoinFailed`]. Joining while already joined is a no-op.
    pub async fn join(&self) -> Result<()> {
        let config = &self.inner.config;
        let (generation, request) = {
            let mut state = self.inner.state.lock();
            match state.phase {
                SessionPhase::Left => return Err(Error::SessionClosed),
                SessionPhase::Joining | SessionPhase::Joined => {
                    debug!(room_id = %config.room_id, "Join ignored, already joining or joined");
                    return Ok(());
                }
                SessionPhase::Idle | SessionPhase::Failed => {}
            }
            state.phase = SessionPhase::Joining;
            let request = JoinRoom {
                room_id: config.room_id.clone(),
                display_name: config.display_name.clone(),
                role: config.role,
                user_id: config.user_id.clone(),
                token: state.join_token.clone(),
            };
            (state.generation, request)
        };

        info!(room_id = %config.room_id, role = %config.role, "Joining room");

        match self.try_join(generation, request).await {
            Ok(()) => Ok(()),
            Err(Error::SessionClosed) if !self.is_current(generation) => Err(Error::SessionClosed),
            Err(e) => {
                error!(room_id = %config.room_id, error = %e, "Failed to join room");
                let posts = {
                    let mut state = self.inner.state.lock();
                    if state.generation == generation {
                        state.phase = SessionPhase::Failed;
                        state.teardown()
                    } else {
                        Vec::new()
                    }
                };
                self.post_all(posts);
                let err = Error::JoinFailed(Box::new(e));
                self.notify(StudioNotice::SessionFailed {
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn try_join(&self, generation: u64, request: JoinRoom) -> Result<()> {
        let signaling = self.signaling();
        let joined = signaling.join_room(request).await?;

        {
            let mut state = self.inner.state.lock();
            if state.generation != generation {
                return Err(Error::SessionClosed);
            }
            let local = self.inner.engine.rtp_capabilities();
            state
                .negotiator
                .load(joined.router_rtp_capabilities, &local)?;
            state.local_socket_id = Some(joined.socket_id.clone());
            // A roster pushed before the join reply could not tell us apart
            state.directory.remove(&joined.socket_id);
            for info in joined.participants {
                if info.socket_id != joined.socket_id {
                    state.directory.upsert(info);
                }
            }
        }

        for direction in [Direction::Send, Direction::Recv] {
            let transport =
                Arc::new(Transport::create(direction, &signaling, self.inner.engine.as_ref()).await?);
            let stale = {
                let mut state = self.inner.state.lock();
                if state.generation == generation {
                    match direction {
                        Direction::Send => state.send_transport = Some(Arc::clone(&transport)),
                        Direction::Recv => state.recv_transport = Some(Arc::clone(&transport)),
                    }
                    false
                } else {
                    true
                }
            };
            if stale {
                transport.close();
                signaling.post(ClientRequest::CloseTransport {
                    transport_id: transport.id().clone(),
                });
                return Err(Error::SessionClosed);
            }
        }

        let buffered = {
            let mut state = self.inner.state.lock();
            if state.generation != generation {
                return Err(Error::SessionClosed);
            }
            state.phase = SessionPhase::Joined;
            state.ledger.take_buffered()
        };

        info!(
            room_id = %self.inner.config.room_id,
            socket_id = %joined.socket_id,
            buffered = buffered.len(),
            "Joined room"
        );

        for producer in buffered {
            self.on_new_producer(producer).await;
        }
        Ok(())
    }

    /// Leave the room. Local tracks stop immediately; close requests are
    /// posted without waiting for the server. Terminal for this session.
    pub fn leave(&self) {
        let posts = {
            let mut state = self.inner.state.lock();
            if state.phase == SessionPhase::Left {
                return;
            }
            let was_in_room = matches!(state.phase, SessionPhase::Joining | SessionPhase::Joined);
            let mut posts = state.teardown();
            if was_in_room {
                posts.push(ClientRequest::LeaveRoom {
                    room_id: self.inner.config.room_id.clone(),
                });
            }
            state.phase = SessionPhase::Left;
            posts
        };
        self.inner.shutdown.cancel();
        self.post_all(posts);
        info!(room_id = %self.inner.config.room_id, "Left room");
    }

    /// Tear down and join again over the same channel, re-enabling the
    /// sources that were enabled before
    pub async fn rejoin(&self) -> Result<()> {
        self.restart(None).await
    }

    /// Like [`Self::rejoin`], over a fresh signaling channel
    pub async fn reconnect(&self, channel: Arc<dyn SignalingChannel>) -> Result<()> {
        self.restart(Some(channel)).await
    }

    async fn restart(&self, channel: Option<Arc<dyn SignalingChannel>>) -> Result<()> {
        let (sources, posts) = {
            let mut state = self.inner.state.lock();
            if state.phase == SessionPhase::Left {
                return Err(Error::SessionClosed);
            }
            let sources = state.producers.enabled_sources();
            let was_in_room = matches!(state.phase, SessionPhase::Joining | SessionPhase::Joined);
            let mut posts = state.teardown();
            if was_in_room {
                posts.push(ClientRequest::LeaveRoom {
                    room_id: self.inner.config.room_id.clone(),
                });
            }
            state.phase = SessionPhase::Idle;
            (sources, posts)
        };
        // Close requests belong to the old link
        self.post_all(posts);
        if let Some(channel) = channel {
            *self.inner.signaling.write() = Signaling::new(channel);
        }

        info!(room_id = %self.inner.config.room_id, sources = sources.len(), "Rejoining room");
        self.join().await?;

        for source in sources {
            if let Err(e) = self.enable_source(source).await {
                warn!(%source, error = %e, "Failed to re-enable source after rejoin");
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Local media
    // ---------------------------------------------------------------------

    pub async fn enable_camera(&self) -> Result<()> {
        self.enable_source(SourceKind::Webcam).await
    }

    pub async fn disable_camera(&self) -> Result<()> {
        self.disable_source(SourceKind::Webcam).await
    }

    pub async fn enable_microphone(&self) -> Result<()> {
        self.enable_source(SourceKind::Microphone).await
    }

    pub async fn disable_microphone(&self) -> Result<()> {
        self.disable_source(SourceKind::Microphone).await
    }

    pub async fn start_screen_share(&self) -> Result<()> {
        self.enable_source(SourceKind::Screen).await
    }

    pub async fn stop_screen_share(&self) -> Result<()> {
        self.disable_source(SourceKind::Screen).await
    }

    /// Capture `source` and publish it.
    ///
    /// A no-op before join completes and while the source is already
    /// enabled or being enabled. Fails with [`Error::SourceBusy`] while the
    /// previous producer for `source` is still closing.
    pub async fn enable_source(&self, source: SourceKind) -> Result<()> {
        let kind = source.media_kind();
        let (generation, transport) = {
            let mut state = self.inner.state.lock();
            let transport = match (&state.phase, &state.send_transport) {
                (SessionPhase::Joined, Some(t)) if state.negotiator.is_loaded() => Arc::clone(t),
                _ => {
                    debug!(%source, phase = ?state.phase, "Enable ignored, session not joined");
                    return Ok(());
                }
            };
            if !state.negotiator.can_produce(kind) {
                return Err(Error::CannotProduce(kind));
            }
            if state.producers.get(source).is_some_and(LocalProducer::is_closing) {
                return Err(Error::SourceBusy(source));
            }
            if !state.producers.begin(source) {
                debug!(%source, "Enable ignored, source already enabled");
                return Ok(());
            }
            (state.generation, transport)
        };

        let track = match self.inner.capture.acquire(source).await {
            Ok(track) => track,
            Err(e) => {
                self.abandon_enable(generation, source, &e);
                return Err(e);
            }
        };

        let signaling = self.signaling();
        let producer_id = match transport.produce(&signaling, source, &track).await {
            Ok(id) => id,
            Err(e) => {
                track.stop();
                self.abandon_enable(generation, source, &e);
                return Err(e);
            }
        };

        let watcher = {
            let mut state = self.inner.state.lock();
            if state.generation == generation && state.producers.is_reserved(source) {
                let watcher = state.watchers.child_token();
                state.producers.insert(LocalProducer::new(
                    producer_id.clone(),
                    source,
                    Arc::clone(&track),
                    watcher.clone(),
                ));
                Some(watcher)
            } else {
                None
            }
        };

        let Some(watcher) = watcher else {
            debug!(%source, %producer_id, "Session torn down during enable, discarding producer");
            track.stop();
            transport.stop_sending(track.id());
            signaling.post(ClientRequest::CloseProducer { producer_id });
            return Err(Error::SessionClosed);
        };

        self.watch_track_end(source, producer_id.clone(), &track, watcher);
        info!(%source, %producer_id, track_id = %track.id(), "Source enabled");
        Ok(())
    }

    fn abandon_enable(&self, generation: u64, source: SourceKind, error: &Error) {
        {
            let mut state = self.inner.state.lock();
            if state.generation == generation {
                state.producers.abandon(source);
            }
        }
        warn!(%source, error = %error, "Failed to enable source");
        self.notify(StudioNotice::MediaFailed {
            source,
            message: error.to_string(),
        });
    }

    /// Treat the track ending on its own like an explicit disable
    fn watch_track_end(
        &self,
        source: SourceKind,
        producer_id: ProducerId,
        track: &Arc<dyn LocalTrack>,
        watcher: CancellationToken,
    ) {
        let ended = track.ended();
        let session: Weak<SessionInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::select! {
                () = watcher.cancelled() => {}
                () = ended => {
                    let Some(inner) = session.upgrade() else {
                        return;
                    };
                    info!(%source, %producer_id, "Track ended externally");
                    let session = Session { inner };
                    if let Err(e) = session.close_producer(source, Some(&producer_id)).await {
                        warn!(%source, %producer_id, error = %e, "Failed to close ended producer");
                    }
                }
            }
        });
    }

    /// Stop publishing `source`. A no-op if it is not enabled.
    pub async fn disable_source(&self, source: SourceKind) -> Result<()> {
        self.close_producer(source, None).await
    }

    async fn close_producer(&self, source: SourceKind, expected: Option<&ProducerId>) -> Result<()> {
        let (generation, producer_id, track, watcher, transport) = {
            let mut state = self.inner.state.lock();
            if let Some(expected) = expected {
                if state.producers.get(source).map(|p| &p.id) != Some(expected) {
                    return Ok(());
                }
            }
            let Some((producer_id, track, watcher)) = state.producers.begin_close(source) else {
                debug!(%source, "Disable ignored, source not enabled");
                return Ok(());
            };
            (
                state.generation,
                producer_id,
                track,
                watcher,
                state.send_transport.clone(),
            )
        };

        watcher.cancel();
        track.stop();
        if let Some(transport) = &transport {
            transport.stop_sending(track.id());
        }

        let result = self.signaling().close_producer(&producer_id).await;
        {
            let mut state = self.inner.state.lock();
            if state.generation == generation {
                state.producers.finish_close(source, &producer_id);
            }
        }

        match result {
            Ok(()) => {
                info!(%source, %producer_id, "Source disabled");
                Ok(())
            }
            Err(e) => {
                warn!(%source, %producer_id, error = %e, "Server did not confirm producer close");
                Err(e)
            }
        }
    }

    /// Stop every local producer and request its server-side close
    pub fn close_all_producers(&self) {
        let posts = self.inner.state.lock().drain_producers();
        if !posts.is_empty() {
            info!(count = posts.len(), "Closed all producers");
        }
        self.post_all(posts);
    }

    // ---------------------------------------------------------------------
    // Server events
    // ---------------------------------------------------------------------

    /// Consume server events until the stream ends or the session is left
    pub async fn run(&self, mut events: mpsc::Receiver<ServerEvent>) {
        loop {
            tokio::select! {
                () = self.inner.shutdown.cancelled() => break,
                event = events.recv() => {
                    let Some(event) = event else {
                        self.on_signaling_lost();
                        break;
                    };
                    match event {
                        // Consumes run concurrently so one slow negotiation
                        // does not hold up presence events
                        ServerEvent::NewProducer(_) | ServerEvent::ExistingProducers { .. } => {
                            let session = self.clone();
                            tokio::spawn(async move { session.handle_event(event).await });
                        }
                        event => self.handle_event(event).await,
                    }
                }
            }
        }
        debug!(room_id = %self.inner.config.room_id, "Event loop stopped");
    }

    fn on_signaling_lost(&self) {
        let joined = self.inner.state.lock().phase == SessionPhase::Joined;
        if joined {
            warn!(room_id = %self.inner.config.room_id, "Signaling event stream ended");
            self.notify(StudioNotice::SignalingLost);
        }
    }

    /// Apply one server event. Never fails: problems are logged and, where
    /// the user should know, published as notices.
    pub async fn handle_event(&self, event: ServerEvent) {
        debug!(event = event.name(), "Server event");
        match event {
            ServerEvent::StreamUpdate { participants } => self.on_roster(participants),
            ServerEvent::ParticipantJoined(info) => self.on_roster(vec![info]),
            ServerEvent::ParticipantLeft { socket_id } => self.on_participant_left(&socket_id),
            ServerEvent::NewProducer(producer) => self.on_new_producer(producer).await,
            ServerEvent::ExistingProducers { producers } => {
                for producer in producers {
                    self.on_new_producer(producer).await;
                }
            }
            ServerEvent::ProducerClosed { producer_id } => self.on_producer_closed(&producer_id),
            ServerEvent::GuestRequest(request) => self.on_guest_request(request),
            ServerEvent::GuestApproved { token } => self.on_guest_approved(token).await,
            ServerEvent::GuestDenied { reason } => self.on_guest_denied(reason),
            ServerEvent::Error { message } => {
                warn!(%message, "Server reported an error");
                self.notify(StudioNotice::ServerError { message });
            }
        }
    }

    fn on_roster(&self, participants: Vec<ParticipantInfo>) {
        let mut state = self.inner.state.lock();
        if matches!(state.phase, SessionPhase::Left | SessionPhase::Failed) {
            return;
        }
        for info in participants {
            if !state.is_local(&info.socket_id) {
                state.directory.upsert(info);
            }
        }
    }

    fn on_participant_left(&self, socket_id: &SocketId) {
        let removed = {
            let mut state = self.inner.state.lock();
            if state.is_local(socket_id) {
                return;
            }
            state.ledger.forget_owner(socket_id);
            state.directory.remove(socket_id)
        };
        let Some(participant) = removed else {
            debug!(%socket_id, "Leave for unknown participant");
            return;
        };
        for consumer in &participant.consumers {
            consumer.close();
        }
        info!(
            %socket_id,
            consumers = participant.consumers.len(),
            "Participant left"
        );
    }

    async fn on_new_producer(&self, producer: NewProducer) {
        let producer_id = producer.producer_id.clone();
        let job = {
            let mut state = self.inner.state.lock();
            if state.is_local(&producer.owner_socket_id) {
                debug!(%producer_id, "Ignoring own producer");
                return;
            }
            if matches!(state.phase, SessionPhase::Left | SessionPhase::Failed) {
                return;
            }
            let consumed = state.directory.has_producer(&producer_id);
            let ready = state.can_consume();
            match state.ledger.admit(&producer, consumed, ready) {
                Admission::Ignore => {
                    debug!(%producer_id, "Producer already known, ignoring");
                    return;
                }
                Admission::Buffer => {
                    debug!(%producer_id, "Buffering producer until joined");
                    state.ledger.buffer(producer);
                    return;
                }
                Admission::Consume => {}
            }
            let (Some(transport), Ok(device)) =
                (state.recv_transport.clone(), state.negotiator.device())
            else {
                return;
            };
            state.ledger.begin(&producer);
            state.directory.ensure(&producer.owner_socket_id);
            ConsumeJob {
                generation: state.generation,
                transport,
                capabilities: device.rtp_capabilities().clone(),
                producer,
            }
        };

        if let Err(e) = self.consume(job).await {
            warn!(%producer_id, error = %e, "Failed to consume producer");
        }
    }

    async fn consume(&self, job: ConsumeJob) -> Result<()> {
        let ConsumeJob {
            generation,
            transport,
            capabilities,
            producer,
        } = job;
        let producer_id = producer.producer_id;
        let signaling = self.signaling();

        let (options, track) = match transport
            .consume(&signaling, &producer_id, capabilities)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                let mut state = self.inner.state.lock();
                if state.generation == generation {
                    state.ledger.finish(&producer_id);
                }
                return Err(e);
            }
        };
        let consumer = RemoteConsumer::new(options, producer.owner_socket_id, track);

        let still_wanted = {
            let state = self.inner.state.lock();
            state.generation == generation && !state.ledger.is_closed(&producer_id)
        };
        let resumed = if still_wanted {
            signaling.resume_consumer(&consumer.id).await
        } else {
            Ok(())
        };

        let registered = {
            let mut state = self.inner.state.lock();
            let wanted = state.generation == generation && state.ledger.finish(&producer_id);
            if wanted && still_wanted && resumed.is_ok() {
                state.directory.attach(consumer.clone());
                true
            } else {
                false
            }
        };

        if registered {
            info!(
                %producer_id,
                consumer_id = %consumer.id,
                owner = %consumer.owner,
                kind = %consumer.kind,
                "Consumer registered"
            );
            return Ok(());
        }

        consumer.close();
        signaling.post(ClientRequest::CloseConsumer {
            consumer_id: consumer.id.clone(),
        });
        match resumed {
            Ok(()) => {
                debug!(%producer_id, "Producer went away during consume, consumer discarded");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn on_producer_closed(&self, producer_id: &ProducerId) {
        let removed = {
            let mut state = self.inner.state.lock();
            state.ledger.mark_closed(producer_id);
            state.directory.remove_consumer_by_producer(producer_id)
        };
        match removed {
            Some(consumer) => {
                consumer.close();
                info!(%producer_id, owner = %consumer.owner, "Remote producer closed");
            }
            None => debug!(%producer_id, "Close for unconsumed producer recorded"),
        }
    }

    fn on_guest_request(&self, request: GuestRequest) {
        if self.inner.config.role != Role::Host {
            debug!(requester = %request.requester_socket_id, "Guest request ignored, not host");
            return;
        }
        info!(
            requester = %request.requester_socket_id,
            display_name = %request.display_name,
            "Guest requested admission"
        );
        self.inner.state.lock().admission.submit(request.clone());
        self.notify(StudioNotice::GuestRequested(request));
    }

    async fn on_guest_approved(&self, token: String) {
        if self.inner.config.role == Role::Host {
            return;
        }
        let should_join = {
            let mut state = self.inner.state.lock();
            state.admission_state = AdmissionState::Approved {
                token: token.clone(),
            };
            state.join_token = Some(token.clone());
            self.inner.config.auto_join_on_approval
                && matches!(state.phase, SessionPhase::Idle | SessionPhase::Failed)
        };
        info!(room_id = %self.inner.config.room_id, "Admission approved");
        self.notify(StudioNotice::AdmissionChanged(AdmissionState::Approved { token }));

        if should_join {
            // Failures are already logged and published by join
            let _ = self.join().await;
        }
    }

    fn on_guest_denied(&self, reason: Option<String>) {
        if self.inner.config.role == Role::Host {
            return;
        }
        let state = AdmissionState::Denied { reason };
        self.inner.state.lock().admission_state = state.clone();
        info!(room_id = %self.inner.config.room_id, "Admission denied");
        self.notify(StudioNotice::AdmissionChanged(state));
    }

    // ---------------------------------------------------------------------
    // Guest admission
    // ---------------------------------------------------------------------

    /// Ask the host to be let in. Hosts and joined sessions need no
    /// admission, so this is a no-op for them.
    pub async fn request_admission(&self) -> Result<()> {
        let config = &self.inner.config;
        if config.role == Role::Host {
            debug!("Admission request ignored, host needs none");
            return Ok(());
        }
        {
            let mut state = self.inner.state.lock();
            match state.phase {
                SessionPhase::Left => return Err(Error::SessionClosed),
                SessionPhase::Joining | SessionPhase::Joined => return Ok(()),
                SessionPhase::Idle | SessionPhase::Failed => {}
            }
            state.admission_state = AdmissionState::Requested;
        }
        self.notify(StudioNotice::AdmissionChanged(AdmissionState::Requested));

        match self
            .signaling()
            .request_admission(&config.room_id, &config.display_name)
            .await
        {
            Ok(()) => {
                info!(room_id = %config.room_id, "Admission requested");
                Ok(())
            }
            Err(e) => {
                let reset = {
                    let mut state = self.inner.state.lock();
                    let requested = state.admission_state == AdmissionState::Requested;
                    if requested {
                        state.admission_state = AdmissionState::Idle;
                    }
                    requested
                };
                if reset {
                    self.notify(StudioNotice::AdmissionChanged(AdmissionState::Idle));
                }
                Err(e)
            }
        }
    }

    /// Let a pending guest in. The entry is removed even if the server
    /// refuses the approval.
    pub async fn approve_guest(&self, requester: &SocketId) -> Result<()> {
        if self.inner.config.role != Role::Host {
            return Err(Error::NotHost);
        }
        let request = self.inner.state.lock().admission.take(requester)?;
        self.signaling()
            .approve_guest(&request.requester_socket_id, &request.room_id, &request.token)
            .await
            .inspect_err(|e| warn!(%requester, error = %e, "Guest approval failed"))?;
        info!(%requester, display_name = %request.display_name, "Guest approved");
        Ok(())
    }

    /// Turn a pending guest away. The requester is notified by the server.
    pub fn deny_guest(&self, requester: &SocketId) -> Result<()> {
        if self.inner.config.role != Role::Host {
            return Err(Error::NotHost);
        }
        let request = self.inner.state.lock().admission.take(requester)?;
        self.signaling().post(ClientRequest::DenyGuest {
            requester_socket_id: request.requester_socket_id,
            room_id: request.room_id,
        });
        info!(%requester, "Guest denied");
        Ok(())
    }

    #[must_use]
    pub fn pending_guests(&self) -> Vec<GuestRequest> {
        self.inner.state.lock().admission.pending()
    }

    // ---------------------------------------------------------------------
    // Presentation
    // ---------------------------------------------------------------------

    /// Record that the UI bound a consumer's track to an element
    pub fn mark_attached(&self, consumer_id: &ConsumerId) -> bool {
        self.inner.state.lock().directory.mark_attached(consumer_id)
    }

    #[must_use]
    pub fn snapshot(&self) -> StudioSnapshot {
        let state = self.inner.state.lock();
        let flags = state.producers.flags();
        StudioSnapshot {
            phase: state.phase,
            local_socket_id: state.local_socket_id.clone(),
            camera_enabled: flags.camera,
            microphone_enabled: flags.microphone,
            screen_enabled: flags.screen,
            participants: state.directory.iter().map(ParticipantView::from).collect(),
            pending_guests: state.admission.pending(),
            admission: state.admission_state.clone(),
        }
    }

    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        self.inner.state.lock().phase
    }

    #[must_use]
    pub fn local_socket_id(&self) -> Option<SocketId> {
        self.inner.state.lock().local_socket_id.clone()
    }

    #[must_use]
    pub fn admission_state(&self) -> AdmissionState {
        self.inner.state.lock().admission_state.clone()
    }

    /// Server id of the active producer for `source`
    #[must_use]
    pub fn local_producer(&self, source: SourceKind) -> Option<ProducerId> {
        let state = self.inner.state.lock();
        state
            .producers
            .get(source)
            .filter(|p| !p.is_closing())
            .map(|p| p.id.clone())
    }

    #[must_use]
    pub fn can_produce(&self, kind: MediaKind) -> bool {
        self.inner.state.lock().negotiator.can_produce(kind)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Session")
            .field("room_id", &self.inner.config.room_id)
            .field("role", &self.inner.config.role)
            .field("phase", &state.phase)
            .field("generation", &state.generation)
            .finish_non_exhaustive()
    }
}
