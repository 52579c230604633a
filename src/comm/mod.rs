//! Hub-level communicator: the module registry, message routing between
//! local queues and framed TCP hub links, and the cluster-wide barrier.
//!
//! One communicator runs per hub process. Local modules hang off message
//! queue pairs; peer hubs connect over TCP with the length-delimited frame
//! codec. Everything funnels into one ingress stream so routing and
//! barrier bookkeeping stay single-threaded while senders never block each
//! other.

mod barrier;

pub use barrier::BarrierPhase;

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use uuid::Uuid;

use crate::core::codec::{Frame, MessageCodec};
use crate::core::message::{
    BarrierStatus, Buffer, Envelope, MessageKind, ModuleId, Payload, PeerKind, SequenceTracker,
    Sequencer,
};
use crate::core::meta::AvailableModule;
use crate::core::queue::{MessageQueue, QueueSender};
use crate::util::SystemConfig;
use crate::{Error, Result};

use barrier::BarrierCoordinator;

enum Event {
    Module(ModuleId, Frame),
    ModuleGone(ModuleId),
    Hub(ModuleId, Frame),
    HubGone(ModuleId),
}

struct ModuleEntry {
    name: String,
    queue: QueueSender,
    transferring: u32,
}

struct HubLink {
    name: String,
    address: String,
    tx: mpsc::Sender<Frame>,
}

/// The relay at the heart of a hub process.
pub struct Communicator {
    id: ModuleId,
    session: String,
    config: SystemConfig,
    sequencer: Sequencer,
    tracker: Mutex<SequenceTracker>,
    modules: DashMap<ModuleId, ModuleEntry>,
    /// Modules living on peer hubs, by owning hub.
    remote: DashMap<ModuleId, ModuleId>,
    hubs: DashMap<ModuleId, HubLink>,
    available: DashMap<(ModuleId, String), AvailableModule>,
    barrier: Mutex<BarrierCoordinator>,
    ingress_tx: mpsc::Sender<Event>,
    ingress_rx: tokio::sync::Mutex<mpsc::Receiver<Event>>,
    next_module: AtomicI32,
}

impl Communicator {
    pub fn new(id: ModuleId, session: impl Into<String>, config: SystemConfig) -> Arc<Self> {
        let (ingress_tx, ingress_rx) = mpsc::channel(config.queue_capacity.max(16));
        Arc::new(Self {
            id,
            session: session.into(),
            config,
            sequencer: Sequencer::new(),
            tracker: Mutex::new(SequenceTracker::new()),
            modules: DashMap::new(),
            remote: DashMap::new(),
            hubs: DashMap::new(),
            available: DashMap::new(),
            barrier: Mutex::new(BarrierCoordinator::new()),
            ingress_tx,
            ingress_rx: tokio::sync::Mutex::new(ingress_rx),
            next_module: AtomicI32::new(ModuleId::MODULE_BASE.0),
        })
    }

    pub fn id(&self) -> ModuleId {
        self.id
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    /// Next free module id on this hub.
    pub fn allocate_id(&self) -> ModuleId {
        ModuleId(self.next_module.fetch_add(1, Ordering::Relaxed))
    }

    /// Attach a local module under `id`; returns the module's end of its
    /// queue pair. The relay end feeds the ingress stream until the module
    /// hangs up.
    pub fn register_module(&self, id: ModuleId, name: &str) -> Result<MessageQueue> {
        if !id.is_module() {
            return Err(Error::Module(format!("{id} is not a module id")));
        }
        if self.modules.contains_key(&id) {
            return Err(Error::Module(format!("module id {id} is already taken")));
        }
        let (module_end, mut relay_end) = MessageQueue::pair(self.config.queue_capacity);
        self.modules.insert(
            id,
            ModuleEntry {
                name: name.to_string(),
                queue: relay_end.sender(),
                transferring: 0,
            },
        );
        let ingress = self.ingress_tx.clone();
        tokio::spawn(async move {
            while let Some(frame) = relay_end.recv().await {
                if ingress.send(Event::Module(id, frame)).await.is_err() {
                    return;
                }
            }
            let _ = ingress.send(Event::ModuleGone(id)).await;
        });
        tracing::info!(module = %id, name, "module registered");
        Ok(module_end)
    }

    /// Record a spawnable module in the availability registry.
    pub fn add_available(&self, module: AvailableModule) {
        self.available
            .insert((ModuleId(module.hub), module.name.clone()), module);
    }

    pub fn available_modules(&self) -> Vec<AvailableModule> {
        self.available.iter().map(|e| e.value().clone()).collect()
    }

    /// Local modules by id and name.
    pub fn modules(&self) -> Vec<(ModuleId, String)> {
        self.modules
            .iter()
            .map(|e| (*e.key(), e.value().name.clone()))
            .collect()
    }

    /// Connected peer hubs by id, name and address.
    pub fn hubs(&self) -> Vec<(ModuleId, String, String)> {
        self.hubs
            .iter()
            .map(|e| (*e.key(), e.value().name.clone(), e.value().address.clone()))
            .collect()
    }

    /// Number of bulk object transfers currently in flight, as last
    /// reported by the local modules.
    pub fn transfers_in_flight(&self) -> u32 {
        self.modules.iter().map(|e| e.value().transferring).sum()
    }

    /// Dial a peer hub and identify ourselves.
    pub async fn connect_hub(&self, hub: ModuleId, name: &str, address: &str) -> Result<()> {
        let stream = TcpStream::connect(address).await?;
        let mut framed = Framed::new(stream, MessageCodec);
        let identify = self.sequencer.stamp(
            Envelope::new(
                self.id,
                0,
                MessageKind::Identify {
                    kind: PeerKind::Hub,
                    session: self.session.clone(),
                },
            )
            .to(hub),
        );
        framed.send(Frame::new(Buffer::encode(&identify)?)).await?;
        self.adopt_hub(hub, name.to_string(), address.to_string(), framed);
        Ok(())
    }

    /// Accept peer hub connections until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let comm = self.clone();
            tokio::spawn(async move {
                let mut framed = Framed::new(stream, MessageCodec);
                let first = match framed.next().await {
                    Some(Ok(frame)) => frame,
                    _ => return,
                };
                let env = match first.buffer.decode() {
                    Ok(env) => env,
                    Err(err) => {
                        tracing::warn!("dropping connection from {peer}: {err}");
                        return;
                    }
                };
                match env.kind {
                    MessageKind::Identify { kind: PeerKind::Hub, ref session }
                        if *session == comm.session =>
                    {
                        tracing::info!(hub = %env.sender, %peer, "hub connected");
                        comm.adopt_hub(env.sender, format!("{peer}"), format!("{peer}"), framed);
                    }
                    MessageKind::Identify { ref session, .. } => {
                        tracing::warn!(
                            "rejecting {peer}: session '{session}' does not match '{}'",
                            comm.session
                        );
                    }
                    _ => {
                        tracing::warn!("rejecting {peer}: expected Identify, got {:?}", env.kind);
                    }
                }
            });
        }
    }

    fn adopt_hub(
        &self,
        hub: ModuleId,
        name: String,
        address: String,
        framed: Framed<TcpStream, MessageCodec>,
    ) {
        let (mut sink, mut stream) = framed.split();
        let (tx, mut out_rx) = mpsc::channel::<Frame>(self.config.queue_capacity);
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if sink.send(frame).await.is_err() {
                    return;
                }
            }
        });

        let ingress = self.ingress_tx.clone();
        tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(frame) => {
                        if ingress.send(Event::Hub(hub, frame)).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(hub = %hub, "hub link broke: {err}");
                        break;
                    }
                }
            }
            let _ = ingress.send(Event::HubGone(hub)).await;
        });

        self.hubs.insert(hub, HubLink { name, address, tx });
    }

    /// Drive routing and barrier bookkeeping until every sender is gone.
    pub async fn run(self: &Arc<Self>) {
        let mut rx = self.ingress_rx.lock().await;
        while let Some(event) = rx.recv().await {
            match event {
                Event::Module(origin, frame) | Event::Hub(origin, frame) => {
                    let env = match frame.buffer.decode() {
                        Ok(env) => env,
                        Err(err) => {
                            tracing::warn!(%origin, "dropping malformed message: {err}");
                            continue;
                        }
                    };
                    if let Err(err) = self.tracker.lock().observe(&env) {
                        tracing::warn!("dropping message: {err}");
                        continue;
                    }
                    self.dispatch(env, frame.payload, origin).await;
                }
                Event::ModuleGone(module) => {
                    // Reached only when the module vanished without a
                    // proper ModuleExit.
                    self.remove_module(module, true).await;
                }
                Event::HubGone(hub) => {
                    self.hub_lost(hub).await;
                }
            }
        }
    }

    async fn dispatch(&self, env: Envelope, payload: Option<Payload>, origin: ModuleId) {
        match &env.kind {
            MessageKind::Started { name } => {
                tracing::info!(module = %env.sender, name, "module up");
                if self.hubs.contains_key(&origin) {
                    self.remote.insert(env.sender, origin);
                }
                self.route(env, payload, origin).await;
            }
            MessageKind::ModuleExit { module, crashed } => {
                let (module, crashed) = (*module, *crashed);
                self.remote.remove(&module);
                self.remove_module(module, crashed).await;
            }
            MessageKind::BarrierReached { uuid, .. } => {
                let released = self.barrier.lock().reached(*uuid, env.sender);
                if let Some(status) = released {
                    self.broadcast_release(*uuid, status).await;
                }
            }
            MessageKind::Barrier { uuid, .. } if self.hubs.contains_key(&origin) => {
                // A peer hub coordinates; run the barrier over our local
                // modules and report upward when it falls.
                self.relay_barrier(*uuid, env, payload, origin).await;
            }
            MessageKind::DataTransferState { transferring } => {
                if let Some(mut entry) = self.modules.get_mut(&env.sender) {
                    entry.transferring = *transferring;
                }
            }
            MessageKind::SendText { kind, text } => {
                tracing::info!(module = %env.sender, ?kind, "{text}");
                self.route(env, payload, origin).await;
            }
            MessageKind::AddHub { hub, name, .. } => {
                tracing::info!(hub = %hub, name, "hub announced");
                self.route(env, payload, origin).await;
            }
            MessageKind::RemoveHub { hub } => {
                let hub = *hub;
                self.route(env, payload, origin).await;
                self.hub_lost(hub).await;
            }
            _ => {
                self.route(env, payload, origin).await;
            }
        }
    }

    /// Locality-based routing: local modules get their queue, everything
    /// else crosses a hub link. Broadcasts fan out everywhere except back
    /// to where they came from.
    async fn route(&self, env: Envelope, payload: Option<Payload>, origin: ModuleId) {
        let dest = env.dest;
        if dest == ModuleId::BROADCAST || dest == ModuleId::FOR_BROADCAST {
            for (module, queue) in self.local_queues(Some(env.sender)) {
                if queue.send(&env, payload.clone()).await.is_err() {
                    tracing::warn!(module = %module, "broadcast to closed queue");
                }
            }
            self.forward_to_hubs(&env, payload, Some(origin)).await;
            return;
        }
        if dest == ModuleId::LOCAL_HUB || dest == ModuleId::SESSION || dest == self.id {
            // Consumed by dispatch already.
            tracing::debug!(kind = ?env.kind, "message addressed to this hub");
            return;
        }
        if dest.is_module() {
            let local = self.modules.get(&dest).map(|e| e.value().queue.clone());
            if let Some(queue) = local {
                if queue.send(&env, payload).await.is_err() {
                    tracing::warn!(module = %dest, "send to closed queue");
                }
                return;
            }
            let owner = self.remote.get(&dest).map(|e| *e.value());
            if let Some(hub) = owner {
                self.forward_to_hub(hub, &env, payload).await;
                return;
            }
            self.forward_to_hubs(&env, payload, Some(origin)).await;
            return;
        }
        if dest.is_hub() {
            self.forward_to_hub(dest, &env, payload).await;
        }
    }

    /// Snapshot the local module queues so no map guard is held while
    /// sending.
    fn local_queues(&self, skip: Option<ModuleId>) -> Vec<(ModuleId, QueueSender)> {
        self.modules
            .iter()
            .filter(|e| Some(*e.key()) != skip)
            .map(|e| (*e.key(), e.value().queue.clone()))
            .collect()
    }

    fn hub_senders(&self, skip: Option<ModuleId>) -> Vec<(ModuleId, mpsc::Sender<Frame>)> {
        self.hubs
            .iter()
            .filter(|e| Some(*e.key()) != skip)
            .map(|e| (*e.key(), e.value().tx.clone()))
            .collect()
    }

    async fn forward_to_hub(&self, hub: ModuleId, env: &Envelope, payload: Option<Payload>) {
        let Some(tx) = self.hubs.get(&hub).map(|e| e.value().tx.clone()) else {
            tracing::warn!(hub = %hub, "no link for destination hub");
            return;
        };
        match Self::frame(env, payload) {
            Ok(frame) => {
                if tx.send(frame).await.is_err() {
                    tracing::warn!(hub = %hub, "hub link writer is gone");
                }
            }
            Err(err) => tracing::warn!("cannot frame message: {err}"),
        }
    }

    async fn forward_to_hubs(
        &self,
        env: &Envelope,
        payload: Option<Payload>,
        skip: Option<ModuleId>,
    ) {
        for (hub, tx) in self.hub_senders(skip) {
            match Self::frame(env, payload.clone()) {
                Ok(frame) => {
                    if tx.send(frame).await.is_err() {
                        tracing::warn!(hub = %hub, "hub link writer is gone");
                    }
                }
                Err(err) => {
                    tracing::warn!("cannot frame message: {err}");
                    return;
                }
            }
        }
    }

    fn frame(env: &Envelope, payload: Option<Payload>) -> Result<Frame> {
        let buffer = Buffer::encode(env)?;
        Ok(match payload {
            Some(p) => Frame::with_payload(buffer, p),
            None => Frame::new(buffer),
        })
    }

    /// Halt the session: broadcast a barrier and wait for every local
    /// module and peer hub to reach it.
    ///
    /// A participant that neither answers within the configured timeout nor
    /// exits is declared lost, removed, and the barrier releases with
    /// [`BarrierStatus::ParticipantLost`].
    pub async fn start_barrier(self: &Arc<Self>, reason: &str) -> Result<BarrierStatus> {
        let uuid = Uuid::new_v4();
        let participants: Vec<ModuleId> = self
            .modules
            .iter()
            .map(|e| *e.key())
            .chain(self.hubs.iter().map(|e| *e.key()))
            .collect();
        let rx = self.barrier.lock().begin(uuid, participants)?;

        let env = self.sequencer.stamp(Envelope::new(
            self.id,
            0,
            MessageKind::Barrier {
                uuid,
                reason: reason.to_string(),
            },
        ));
        for (_, queue) in self.local_queues(None) {
            let _ = queue.send(&env, None).await;
        }
        self.forward_to_hubs(&env, None, None).await;

        match tokio::time::timeout(self.config.barrier_timeout(), rx).await {
            Ok(Ok(status)) => Ok(status),
            Ok(Err(_)) => Err(Error::ParticipantLost(
                "barrier coordinator went away".to_string(),
            )),
            Err(_) => {
                let missing = self.barrier.lock().timeout();
                tracing::warn!("barrier timed out waiting for {missing:?}");
                for module in missing {
                    if module.is_module() {
                        self.remove_module(module, true).await;
                    }
                }
                self.broadcast_release(uuid, BarrierStatus::ParticipantLost)
                    .await;
                Ok(BarrierStatus::ParticipantLost)
            }
        }
    }

    async fn broadcast_release(&self, uuid: Uuid, status: BarrierStatus) {
        let env = self.sequencer.stamp(Envelope::new(
            self.id,
            0,
            MessageKind::BarrierReached { uuid, status },
        ));
        for (_, queue) in self.local_queues(None) {
            let _ = queue.send(&env, None).await;
        }
        self.forward_to_hubs(&env, None, None).await;
    }

    /// Run a barrier ordered by a coordinating peer hub and answer upward
    /// once our local modules all reached it.
    async fn relay_barrier(
        &self,
        uuid: Uuid,
        env: Envelope,
        payload: Option<Payload>,
        from_hub: ModuleId,
    ) {
        let locals: Vec<ModuleId> = self.modules.iter().map(|e| *e.key()).collect();
        let rx = match self.barrier.lock().begin(uuid, locals) {
            Ok(rx) => rx,
            Err(err) => {
                tracing::warn!("cannot relay barrier {uuid}: {err}");
                return;
            }
        };
        for (_, queue) in self.local_queues(None) {
            let _ = queue.send(&env, payload.clone()).await;
        }

        let up = self.hubs.get(&from_hub).map(|l| l.value().tx.clone());
        let reply = self.sequencer.stamp(
            Envelope::new(
                self.id,
                0,
                MessageKind::BarrierReached {
                    uuid,
                    status: BarrierStatus::Ok,
                },
            )
            .to(from_hub),
        );
        tokio::spawn(async move {
            let status = match rx.await {
                Ok(status) => status,
                Err(_) => BarrierStatus::ParticipantLost,
            };
            let mut reply = reply;
            if let MessageKind::BarrierReached { status: s, .. } = &mut reply.kind {
                *s = status;
            }
            if let (Some(tx), Ok(buffer)) = (up, Buffer::encode(&reply)) {
                let _ = tx.send(Frame::new(buffer)).await;
            }
        });
    }

    async fn remove_module(&self, module: ModuleId, crashed: bool) {
        let local = self.modules.remove(&module).is_some();
        let remote = self.remote.remove(&module).is_some();
        if !local && !remote {
            return;
        }
        tracing::info!(module = %module, crashed, "module gone");

        let (uuid, released) = {
            let mut coord = self.barrier.lock();
            let uuid = coord.uuid();
            (uuid, coord.participant_lost(module))
        };
        if let (Some(uuid), Some(status)) = (uuid, released) {
            self.broadcast_release(uuid, status).await;
        }

        let env = self.sequencer.stamp(Envelope::new(
            self.id,
            0,
            MessageKind::ModuleExit { module, crashed },
        ));
        self.route(env, None, self.id).await;
    }

    /// A peer hub disconnected: its modules are gone and its spawnable
    /// modules disappear from the registry.
    async fn hub_lost(&self, hub: ModuleId) {
        if self.hubs.remove(&hub).is_none() {
            return;
        }
        tracing::warn!(hub = %hub, "hub lost");
        self.available.retain(|(h, _), _| *h != hub);

        let orphans: Vec<ModuleId> = self
            .remote
            .iter()
            .filter(|e| *e.value() == hub)
            .map(|e| *e.key())
            .collect();
        for module in orphans {
            self.remove_module(module, true).await;
        }
    }
}
