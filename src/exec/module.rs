//! Module runtime: lifecycle state machine, ports and the compute hooks.
//!
//! A module process owns one `ModuleRuntime` per rank. The runtime drains
//! the module's message queue, tracks connections and parameters, and hands
//! execution over to the generation driver when an `Execute` arrives. User
//! code plugs in through the [`Compute`] trait.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::codec::Frame;
use crate::core::message::{
    Envelope, ExecStage, MessageKind, ModuleId, Payload, PortKind, Sequencer, TextKind,
};
use crate::core::object::{Interface, Object, ObjectId, TransferMode};
use crate::core::parameter::{Parameter, ParameterSet};
use crate::core::queue::{MessageQueue, QueueSender};
use crate::core::shm::Arena;
use crate::mpi::RankComm;
use crate::{Error, Result};

/// Lifecycle states of a module instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Constructed,
    Ready,
    Preparing,
    Computing,
    Reducing,
    Quitting,
    Destroyed,
}

impl ModuleState {
    /// Whether `self -> next` is a legal lifecycle transition.
    pub fn permits(self, next: ModuleState) -> bool {
        use ModuleState::*;
        matches!(
            (self, next),
            (Constructed, Ready)
                | (Ready, Preparing)
                | (Preparing, Computing)
                | (Computing, Computing)
                | (Computing, Reducing)
                | (Reducing, Ready)
                | (Ready, Quitting)
                | (Constructed, Quitting)
                | (Quitting, Destroyed)
        )
    }
}

/// How the ranks of a module are driven through a generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulingPolicy {
    /// Only rank 0 computes.
    Single,
    /// All ranks step through compute iterations together.
    #[default]
    Gang,
    /// Ranks step together, but a rank without pending input skips its
    /// compute callback instead of invoking it empty.
    LazyGang,
}

/// When `reduce` runs after the compute iterations of a generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReducePolicy {
    Never,
    #[default]
    OverAll,
    PerTimestep,
}

/// How arriving objects are grouped into compute work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ObjectReceivePolicy {
    /// Each arriving object becomes its own work item.
    #[default]
    Single,
    /// All objects queued at execute time form one work item.
    All,
}

#[derive(Debug, Clone)]
pub struct Port {
    pub name: String,
    pub kind: PortKind,
    pub description: String,
}

pub(crate) struct InputPort {
    pub(crate) port: Port,
    pub(crate) queue: VecDeque<Object>,
}

pub(crate) struct OutputPort {
    pub(crate) port: Port,
    pub(crate) connections: Vec<(ModuleId, String)>,
}

/// An object published on an output port, retained until every receiver
/// acknowledged attaching it.
pub(crate) struct Published {
    pub(crate) object: Object,
    pub(crate) pending: usize,
}

/// One unit of compute work: the objects taken off the input ports for a
/// single `compute` invocation.
#[derive(Default)]
pub struct BlockTask {
    pub generation: i32,
    pub timestep: i32,
    pub block: i32,
    objects: HashMap<String, Vec<Object>>,
}

impl BlockTask {
    pub fn empty(generation: i32) -> Self {
        Self {
            generation,
            timestep: -1,
            block: -1,
            objects: HashMap::new(),
        }
    }

    pub fn objects(&self, port: &str) -> &[Object] {
        self.objects.get(port).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.objects.values().all(Vec::is_empty)
    }

    /// The first object on `port`, probed for capability `I`.
    pub fn expect<I: Interface>(&self, port: &str) -> Result<(&Object, I)> {
        let object = self
            .objects
            .get(port)
            .and_then(|v| v.first())
            .ok_or_else(|| Error::Module(format!("no object on input port '{port}'")))?;
        let iface = object
            .interface::<I>()
            .ok_or_else(|| Error::Module(format!("object on '{port}' lacks required interface")))?;
        Ok((object, iface))
    }
}

pub(crate) enum Emitted {
    Object { port: String, object: Object },
    Text { kind: TextKind, text: String },
}

/// Per-invocation view handed to [`Compute`] callbacks.
///
/// Emitted objects and diagnostics are buffered and flushed onto the
/// message queue by the runtime after the callback returns, so compute code
/// never touches the transport directly.
pub struct ComputeContext {
    pub module: ModuleId,
    pub rank: i32,
    pub size: i32,
    pub generation: i32,
    cancel: CancellationToken,
    outbox: mpsc::UnboundedSender<Emitted>,
}

impl ComputeContext {
    /// Polled cooperatively by long computations.
    pub fn cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Publish an object on an output port. Delivery to downstream modules
    /// happens after the current callback returns.
    pub fn add_object(&self, port: &str, object: Object) {
        let _ = self.outbox.send(Emitted::Object {
            port: port.to_string(),
            object,
        });
    }

    pub fn send_error(&self, text: impl Into<String>) {
        let _ = self.outbox.send(Emitted::Text {
            kind: TextKind::Error,
            text: text.into(),
        });
    }

    pub fn send_info(&self, text: impl Into<String>) {
        let _ = self.outbox.send(Emitted::Text {
            kind: TextKind::Info,
            text: text.into(),
        });
    }

    pub fn send_warning(&self, text: impl Into<String>) {
        let _ = self.outbox.send(Emitted::Text {
            kind: TextKind::Warning,
            text: text.into(),
        });
    }
}

/// The compute hooks a module implements.
///
/// `prepare` and `reduce` run on every rank and may use rank collectives;
/// `compute` returns `Ok(false)` to abort the generation without treating
/// it as a transport failure.
#[async_trait::async_trait]
pub trait Compute: Send {
    async fn prepare(&mut self, _ctx: &ComputeContext) -> Result<()> {
        Ok(())
    }

    async fn compute(&mut self, ctx: &ComputeContext, task: &BlockTask) -> Result<bool>;

    async fn reduce(&mut self, _ctx: &ComputeContext, _timestep: i32) -> Result<()> {
        Ok(())
    }
}

/// Drives one rank of a module: message handling, ports, parameters and the
/// lifecycle state machine.
pub struct ModuleRuntime<C: Compute> {
    pub(crate) id: ModuleId,
    pub(crate) name: String,
    pub(crate) state: ModuleState,
    pub(crate) scheduling: SchedulingPolicy,
    pub(crate) reduce_policy: ReducePolicy,
    pub(crate) receive_policy: ObjectReceivePolicy,
    pub(crate) params: ParameterSet,
    pub(crate) inputs: HashMap<String, InputPort>,
    pub(crate) outputs: HashMap<String, OutputPort>,
    pub(crate) arena: Arena,
    pub(crate) comm: Arc<dyn RankComm>,
    pub(crate) relay: QueueSender,
    pub(crate) sequencer: Sequencer,
    pub(crate) cancel: CancellationToken,
    pub(crate) published: HashMap<ObjectId, Published>,
    pub(crate) compute: C,
    pub(crate) generation: i32,
}

/// What the message loop should do after handling one message.
enum Flow {
    Continue,
    Quit,
}

impl<C: Compute> ModuleRuntime<C> {
    pub fn new(
        id: ModuleId,
        name: impl Into<String>,
        arena: Arena,
        comm: Arc<dyn RankComm>,
        relay: QueueSender,
        compute: C,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            state: ModuleState::Constructed,
            scheduling: SchedulingPolicy::default(),
            reduce_policy: ReducePolicy::default(),
            receive_policy: ObjectReceivePolicy::default(),
            params: ParameterSet::new(),
            inputs: HashMap::new(),
            outputs: HashMap::new(),
            arena,
            comm,
            relay,
            sequencer: Sequencer::new(),
            cancel: CancellationToken::new(),
            published: HashMap::new(),
            compute,
            generation: -1,
        }
    }

    pub fn with_scheduling(mut self, policy: SchedulingPolicy) -> Self {
        self.scheduling = policy;
        self
    }

    pub fn with_reduce_policy(mut self, policy: ReducePolicy) -> Self {
        self.reduce_policy = policy;
        self
    }

    pub fn with_receive_policy(mut self, policy: ObjectReceivePolicy) -> Self {
        self.receive_policy = policy;
        self
    }

    pub fn id(&self) -> ModuleId {
        self.id
    }

    pub fn state(&self) -> ModuleState {
        self.state
    }

    pub fn parameters(&self) -> &ParameterSet {
        &self.params
    }

    /// Generation of the last `Execute`, `-1` before the first one.
    pub fn generation(&self) -> i32 {
        self.generation
    }

    pub fn input_ports(&self) -> impl Iterator<Item = &Port> {
        self.inputs.values().map(|p| &p.port)
    }

    pub fn output_ports(&self) -> impl Iterator<Item = &Port> {
        self.outputs.values().map(|p| &p.port)
    }

    pub(crate) fn advance(&mut self, next: ModuleState) -> Result<()> {
        if !self.state.permits(next) {
            return Err(Error::Module(format!(
                "illegal state transition {:?} -> {:?} in module {}",
                self.state, next, self.id
            )));
        }
        tracing::debug!(module = %self.id, "state {:?} -> {:?}", self.state, next);
        self.state = next;
        Ok(())
    }

    /// Register an input port and announce it to the hub.
    pub async fn add_input_port(&mut self, name: &str, description: &str) -> Result<()> {
        let port = Port {
            name: name.to_string(),
            kind: PortKind::Input,
            description: description.to_string(),
        };
        self.inputs.insert(
            name.to_string(),
            InputPort {
                port,
                queue: VecDeque::new(),
            },
        );
        self.post(
            MessageKind::AddPort {
                name: name.to_string(),
                kind: PortKind::Input,
            },
            ModuleId::LOCAL_HUB,
            None,
        )
        .await
    }

    pub async fn add_output_port(&mut self, name: &str, description: &str) -> Result<()> {
        let port = Port {
            name: name.to_string(),
            kind: PortKind::Output,
            description: description.to_string(),
        };
        self.outputs.insert(
            name.to_string(),
            OutputPort {
                port,
                connections: Vec::new(),
            },
        );
        self.post(
            MessageKind::AddPort {
                name: name.to_string(),
                kind: PortKind::Output,
            },
            ModuleId::LOCAL_HUB,
            None,
        )
        .await
    }

    /// Register a parameter and announce it to the hub.
    pub async fn add_parameter(&mut self, param: Parameter) -> Result<()> {
        let kind = MessageKind::AddParameter {
            name: param.name.clone(),
            description: param.description.clone(),
            param_type: param.param_type.clone(),
        };
        self.params.add(param);
        self.post(kind, ModuleId::LOCAL_HUB, None).await
    }

    pub(crate) async fn post(
        &self,
        kind: MessageKind,
        dest: ModuleId,
        payload: Option<Payload>,
    ) -> Result<()> {
        let env = self
            .sequencer
            .stamp(Envelope::new(self.id, self.comm.rank(), kind).to(dest));
        let env = match &payload {
            Some(p) => env.with_payload(p.id),
            None => env,
        };
        self.relay.send(&env, payload).await
    }

    /// Main loop of a module rank: drain the queue until `Quit` or
    /// disconnection, then announce the exit.
    pub async fn run(&mut self, queue: &mut MessageQueue) -> Result<()> {
        self.post(
            MessageKind::Started {
                name: self.name.clone(),
            },
            ModuleId::LOCAL_HUB,
            None,
        )
        .await?;
        self.advance(ModuleState::Ready)?;

        let mut crashed = false;
        // Messages that arrived while a generation was running, replayed in
        // order before the queue is polled again.
        let mut pending: VecDeque<Frame> = VecDeque::new();
        let mut open = true;
        while open || !pending.is_empty() {
            let frame = match pending.pop_front() {
                Some(frame) => frame,
                None => match queue.recv().await {
                    Some(frame) => frame,
                    None => {
                        open = false;
                        continue;
                    }
                },
            };
            let env = match frame.buffer.decode() {
                Ok(env) => env,
                Err(err) => {
                    tracing::warn!(module = %self.id, "dropping malformed message: {err}");
                    continue;
                }
            };
            let flow = match env.kind {
                MessageKind::Execute { module, generation }
                    if module == self.id || module == ModuleId::BROADCAST =>
                {
                    self.run_execute(queue, generation, &mut pending, &mut open)
                        .await
                }
                _ => self.handle(env, frame.payload).await,
            };
            match flow {
                Ok(Flow::Continue) => {}
                Ok(Flow::Quit) => break,
                Err(Error::Compute(text)) => {
                    // Generation failure is isolated: report and stay alive.
                    tracing::error!(module = %self.id, "compute failed: {text}");
                    let _ = self
                        .post(
                            MessageKind::SendText {
                                kind: TextKind::Error,
                                text,
                            },
                            ModuleId::BROADCAST,
                            None,
                        )
                        .await;
                }
                Err(Error::Panicked(text)) => {
                    tracing::error!(module = %self.id, "panic in {text}");
                    crashed = true;
                    break;
                }
                Err(err) => {
                    tracing::warn!(module = %self.id, "message handling failed: {err}");
                }
            }
        }

        if self.state != ModuleState::Quitting {
            // Disconnection or crash path.
            self.state = ModuleState::Quitting;
        }
        let _ = self
            .post(
                MessageKind::ModuleExit {
                    module: self.id,
                    crashed,
                },
                ModuleId::LOCAL_HUB,
                None,
            )
            .await;
        self.advance(ModuleState::Destroyed)?;
        if crashed {
            return Err(Error::Module(format!("module {} crashed", self.id)));
        }
        Ok(())
    }

    /// Drive one generation while keeping the message queue live, so a
    /// `CancelExecute` can interrupt the computation it targets. Every other
    /// message arriving meanwhile is deferred to `pending` in order.
    async fn run_execute(
        &mut self,
        queue: &mut MessageQueue,
        generation: i32,
        pending: &mut VecDeque<Frame>,
        open: &mut bool,
    ) -> Result<Flow> {
        self.post(MessageKind::Busy { module: self.id }, ModuleId::LOCAL_HUB, None)
            .await?;
        self.post(
            MessageKind::ExecutionProgress {
                module: self.id,
                stage: ExecStage::Start,
            },
            ModuleId::LOCAL_HUB,
            None,
        )
        .await?;

        let id = self.id;
        let cancel = self.cancel.clone();
        let outcome = {
            let work = self.execute_generation(generation);
            tokio::pin!(work);
            loop {
                if !*open {
                    break (&mut work).await;
                }
                tokio::select! {
                    outcome = &mut work => break outcome,
                    frame = queue.recv() => match frame {
                        Some(frame) => {
                            let cancels = matches!(
                                frame.buffer.decode(),
                                Ok(Envelope {
                                    kind: MessageKind::CancelExecute { module },
                                    ..
                                }) if module == id
                            );
                            if cancels {
                                cancel.cancel();
                            } else {
                                pending.push_back(frame);
                            }
                        }
                        None => *open = false,
                    },
                }
            }
        };

        self.post(
            MessageKind::ExecutionProgress {
                module: self.id,
                stage: ExecStage::Finish,
            },
            ModuleId::LOCAL_HUB,
            None,
        )
        .await?;
        self.post(MessageKind::Idle { module: self.id }, ModuleId::LOCAL_HUB, None)
            .await?;
        outcome?;
        Ok(Flow::Continue)
    }

    async fn handle(&mut self, env: Envelope, payload: Option<Payload>) -> Result<Flow> {
        match env.kind {
            MessageKind::CancelExecute { module } if module == self.id => {
                // No generation in flight, nothing to interrupt.
                tracing::debug!(module = %self.id, "cancel with no running generation");
                Ok(Flow::Continue)
            }
            MessageKind::SetParameter { module, name, value } if module == self.id => {
                if let Err(err) = self.params.set_value(&name, value) {
                    self.post(
                        MessageKind::SendText {
                            kind: TextKind::Warning,
                            text: format!("parameter '{name}' rejected: {err}"),
                        },
                        ModuleId::BROADCAST,
                        None,
                    )
                    .await?;
                }
                Ok(Flow::Continue)
            }
            MessageKind::SetParameterChoices { name, choices } => {
                self.params
                    .set_choices(&name, choices)
                    .map_err(Error::Module)?;
                Ok(Flow::Continue)
            }
            MessageKind::Connect {
                from_id,
                from_port,
                to_id,
                to_port,
            } => {
                if from_id == self.id {
                    if let Some(out) = self.outputs.get_mut(&from_port) {
                        let link = (to_id, to_port);
                        if !out.connections.contains(&link) {
                            out.connections.push(link);
                        }
                    }
                }
                Ok(Flow::Continue)
            }
            MessageKind::Disconnect {
                from_id,
                from_port,
                to_id,
                to_port,
            } => {
                if from_id == self.id {
                    if let Some(out) = self.outputs.get_mut(&from_port) {
                        out.connections.retain(|c| c.0 != to_id || c.1 != to_port);
                    }
                }
                Ok(Flow::Continue)
            }
            MessageKind::AddObject {
                dest_port,
                object_id,
                ..
            } => {
                let bytes = payload
                    .ok_or_else(|| Error::Protocol("object message without payload".into()))?
                    .bytes;
                let record = bincode::deserialize(&bytes)?;
                let object = Object::from_record(&self.arena, record)?;
                let port = self.inputs.get_mut(&dest_port).ok_or_else(|| {
                    Error::Protocol(format!("object for unknown input port '{dest_port}'"))
                })?;
                port.queue.push_back(object);
                self.post(
                    MessageKind::AddObjectCompleted {
                        object_id,
                        orig_sender: env.sender,
                    },
                    env.sender,
                    None,
                )
                .await?;
                Ok(Flow::Continue)
            }
            MessageKind::AddObjectCompleted { object_id, .. } => {
                if let Some(entry) = self.published.get_mut(&object_id) {
                    entry.pending = entry.pending.saturating_sub(1);
                    if entry.pending == 0 {
                        self.published.remove(&object_id);
                    }
                }
                Ok(Flow::Continue)
            }
            MessageKind::RequestObject { object_id } => {
                let entry = self.published.get(&object_id).ok_or_else(|| {
                    Error::Protocol(format!("requested object {object_id:?} is not published"))
                })?;
                let bytes = entry.object.to_bytes()?;
                self.post(
                    MessageKind::SendObject { object_id },
                    env.sender,
                    Some(Payload::new(bytes)),
                )
                .await?;
                Ok(Flow::Continue)
            }
            MessageKind::Barrier { uuid, .. } => {
                // The loop handles one message at a time, so reaching here
                // means no compute work is in flight on this rank. All ranks
                // of the module meet before the hub hears one acknowledgement,
                // sent by rank 0 on behalf of the instance.
                self.comm.barrier().await;
                if self.comm.rank() == 0 {
                    self.post(
                        MessageKind::BarrierReached {
                            uuid,
                            status: crate::core::message::BarrierStatus::Ok,
                        },
                        ModuleId::LOCAL_HUB,
                        None,
                    )
                    .await?;
                }
                Ok(Flow::Continue)
            }
            MessageKind::Ping { character } => {
                self.post(
                    MessageKind::Pong {
                        character,
                        module: self.id,
                    },
                    env.sender,
                    None,
                )
                .await?;
                Ok(Flow::Continue)
            }
            MessageKind::Kill { module } if module == self.id => {
                self.advance(ModuleState::Quitting)?;
                Ok(Flow::Quit)
            }
            MessageKind::Quit => {
                self.advance(ModuleState::Quitting)?;
                Ok(Flow::Quit)
            }
            _ => Ok(Flow::Continue),
        }
    }

    /// Build the work items for this generation from the queued input
    /// objects, ordered by ascending timestep.
    pub(crate) fn drain_tasks(&mut self, generation: i32) -> Vec<BlockTask> {
        let connected: Vec<String> = self
            .inputs
            .iter()
            .filter(|(_, p)| !p.queue.is_empty())
            .map(|(name, _)| name.clone())
            .collect();

        let mut tasks = Vec::new();
        match self.receive_policy {
            ObjectReceivePolicy::Single => loop {
                let mut objects: HashMap<String, Vec<Object>> = HashMap::new();
                let mut timestep = -1;
                let mut block = -1;
                for name in &connected {
                    if let Some(obj) = self
                        .inputs
                        .get_mut(name)
                        .and_then(|p| p.queue.pop_front())
                    {
                        timestep = timestep.max(obj.meta.timestep);
                        block = block.max(obj.meta.block);
                        objects.entry(name.clone()).or_default().push(obj);
                    }
                }
                if objects.is_empty() {
                    break;
                }
                tasks.push(BlockTask {
                    generation,
                    timestep,
                    block,
                    objects,
                });
            },
            ObjectReceivePolicy::All => {
                let mut objects: HashMap<String, Vec<Object>> = HashMap::new();
                let mut timestep = -1;
                for name in &connected {
                    if let Some(port) = self.inputs.get_mut(name) {
                        let drained: Vec<Object> = port.queue.drain(..).collect();
                        for obj in &drained {
                            timestep = timestep.max(obj.meta.timestep);
                        }
                        objects.insert(name.clone(), drained);
                    }
                }
                if !objects.is_empty() {
                    tasks.push(BlockTask {
                        generation,
                        timestep,
                        block: -1,
                        objects,
                    });
                }
            }
        }
        tasks.sort_by_key(|t| t.timestep);
        tasks
    }

    pub(crate) fn context(&self, generation: i32) -> (ComputeContext, mpsc::UnboundedReceiver<Emitted>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ComputeContext {
                module: self.id,
                rank: self.comm.rank(),
                size: self.comm.size(),
                generation,
                cancel: self.cancel.clone(),
                outbox: tx,
            },
            rx,
        )
    }

    /// Forward everything a compute callback emitted: objects fan out to the
    /// connected downstream ports, diagnostics go to the hub.
    pub(crate) async fn flush_emitted(
        &mut self,
        rx: &mut mpsc::UnboundedReceiver<Emitted>,
    ) -> Result<()> {
        while let Ok(emitted) = rx.try_recv() {
            match emitted {
                Emitted::Object { port, object } => self.publish(&port, object).await?,
                Emitted::Text { kind, text } => {
                    self.post(MessageKind::SendText { kind, text }, ModuleId::BROADCAST, None)
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Publish one object on an output port. Each receiver gets its own
    /// exported arena reference; the sender's own reference is retained in
    /// the published table until every receiver acknowledged.
    pub(crate) async fn publish(&mut self, port: &str, object: Object) -> Result<()> {
        let connections = match self.outputs.get(port) {
            Some(out) => out.connections.clone(),
            None => {
                return Err(Error::Module(format!("unknown output port '{port}'")));
            }
        };
        if connections.is_empty() {
            return Ok(());
        }

        for (dest, dest_port) in &connections {
            let record = object.to_record(TransferMode::Handle);
            let payload = Payload::new(bincode::serialize(&record)?);
            self.post(
                MessageKind::AddObject {
                    sender_port: port.to_string(),
                    dest_port: dest_port.clone(),
                    object_id: object.id,
                    timestep: object.meta.timestep,
                    block: object.meta.block,
                },
                *dest,
                Some(payload),
            )
            .await?;
        }
        self.published.insert(
            object.id,
            Published {
                object,
                pending: connections.len(),
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::shm::ArenaConfig;
    use crate::mpi::SingleRank;

    struct Inert;

    #[async_trait::async_trait]
    impl Compute for Inert {
        async fn compute(&mut self, _ctx: &ComputeContext, _task: &BlockTask) -> Result<bool> {
            Ok(true)
        }
    }

    #[tokio::test]
    async fn disconnect_removes_only_the_named_link() {
        let arena =
            Arena::create(ArenaConfig::private("module-disconnect", 1 << 16)).unwrap();
        let (queue, _relay) = MessageQueue::pair(8);
        let mut runtime = ModuleRuntime::new(
            ModuleId(1),
            "Fanout",
            arena,
            Arc::new(SingleRank),
            queue.sender(),
            Inert,
        );
        runtime.add_output_port("data_out", "objects").await.unwrap();

        let links = [(ModuleId(2), "a"), (ModuleId(2), "b"), (ModuleId(3), "a")];
        for (to_id, to_port) in links {
            let env = Envelope::new(
                ModuleId::LOCAL_HUB,
                0,
                MessageKind::Connect {
                    from_id: ModuleId(1),
                    from_port: "data_out".to_string(),
                    to_id,
                    to_port: to_port.to_string(),
                },
            );
            runtime.handle(env, None).await.unwrap();
        }

        let env = Envelope::new(
            ModuleId::LOCAL_HUB,
            0,
            MessageKind::Disconnect {
                from_id: ModuleId(1),
                from_port: "data_out".to_string(),
                to_id: ModuleId(2),
                to_port: "a".to_string(),
            },
        );
        runtime.handle(env, None).await.unwrap();

        let links = &runtime.outputs["data_out"].connections;
        assert_eq!(links.len(), 2);
        assert!(!links.contains(&(ModuleId(2), "a".to_string())));
        assert!(links.contains(&(ModuleId(2), "b".to_string())));
        assert!(links.contains(&(ModuleId(3), "a".to_string())));
    }

    #[test]
    fn lifecycle_transitions() {
        use ModuleState::*;
        assert!(Constructed.permits(Ready));
        assert!(Ready.permits(Preparing));
        assert!(Preparing.permits(Computing));
        assert!(Computing.permits(Computing));
        assert!(Computing.permits(Reducing));
        assert!(Reducing.permits(Ready));
        assert!(Ready.permits(Quitting));
        assert!(Quitting.permits(Destroyed));

        assert!(!Ready.permits(Computing));
        assert!(!Preparing.permits(Ready));
        assert!(!Destroyed.permits(Ready));
        assert!(!Computing.permits(Quitting));
    }

    #[test]
    fn empty_task_probes_nothing() {
        let task = BlockTask::empty(1);
        assert!(task.is_empty());
        assert!(task.objects("data_in").is_empty());
        assert!(task
            .expect::<crate::core::object::Geometry>("data_in")
            .is_err());
    }
}
