//! Call controller: user intent in, state snapshots out.
//!
//! Owns the single-active-session rule. Every session runs on its own driver
//! task which serializes user commands, call signals, peer events and the
//! connect timeout onto the engine.

use super::engine::{CallContext, CallEngine, CallInputs, CallSnapshot};
use crate::api::DataService;
use crate::error::{Error, Result};
use crate::models::CallType;
use crate::signaling::{CallRef, CallSignal, Frame, OfferPayload};
use crate::transport::Topic;
use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Sleep;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallCommand {
    Initiate,
    Accept,
    Reject,
    HangUp,
    ToggleAudio,
    ToggleVideo,
}

type Reply = oneshot::Sender<Result<Option<bool>>>;
type Commands = mpsc::UnboundedReceiver<(CallCommand, Reply)>;

/// What cut a setup command short.
enum Interruption {
    Timeout,
    Command(CallCommand, Reply),
    Closed,
}

struct ActiveCall {
    call_id: String,
    commands: mpsc::UnboundedSender<(CallCommand, Reply)>,
}

enum Slot {
    Free,
    /// Reserved while the call record is being created.
    Starting,
    Active(ActiveCall),
}

pub struct CallController {
    ctx: CallContext,
    data: Arc<dyn DataService>,
    connect_timeout: Duration,
    slot: Arc<Mutex<Slot>>,
    snapshots: Arc<watch::Sender<Option<CallSnapshot>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl CallController {
    pub fn new(ctx: CallContext, data: Arc<dyn DataService>, connect_timeout: Duration) -> Arc<Self> {
        let (snapshots, _) = watch::channel(None);
        Arc::new(Self {
            ctx,
            data,
            connect_timeout,
            slot: Arc::new(Mutex::new(Slot::Free)),
            snapshots: Arc::new(snapshots),
            listener: Mutex::new(None),
        })
    }

    /// Starts accepting incoming offers. Offers that arrive while a call is
    /// active are answered with `reject-call`.
    pub fn listen(self: &Arc<Self>) {
        let mut subscription = self.ctx.transport.subscribe(Topic::IncomingCalls);
        let this: Weak<Self> = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            while let Some(frame) = subscription.events.recv().await {
                let Some(controller) = this.upgrade() else {
                    break;
                };
                if let Frame::Call(CallSignal::Offer(offer)) = frame {
                    controller.on_incoming_offer(offer);
                }
            }
        });

        if let Some(previous) = self.listener.lock().replace(handle) {
            previous.abort();
        }
    }

    pub fn snapshots(&self) -> watch::Receiver<Option<CallSnapshot>> {
        self.snapshots.subscribe()
    }

    pub fn current(&self) -> Option<CallSnapshot> {
        self.snapshots.borrow().clone()
    }

    pub fn is_busy(&self) -> bool {
        !matches!(*self.slot.lock(), Slot::Free)
    }

    /// Places a call. Returns the call id once the offer is out.
    pub async fn start_call(
        &self,
        peer_id: &str,
        peer_name: &str,
        call_type: CallType,
    ) -> Result<String> {
        {
            let mut slot = self.slot.lock();
            if !matches!(*slot, Slot::Free) {
                return Err(Error::CallInProgress);
            }
            *slot = Slot::Starting;
        }

        let record = match self.data.create_call_record(peer_id, call_type).await {
            Ok(record) => record,
            Err(e) => {
                *self.slot.lock() = Slot::Free;
                return Err(e);
            }
        };

        let (engine, inputs) = CallEngine::outgoing(
            self.ctx.clone(),
            &record.call_id,
            peer_id,
            peer_name,
            call_type,
        );
        self.spawn_driver(engine, inputs);

        self.command(CallCommand::Initiate).await?;
        Ok(record.call_id)
    }

    pub async fn accept(&self) -> Result<()> {
        self.command(CallCommand::Accept).await.map(|_| ())
    }

    pub async fn reject(&self) -> Result<()> {
        self.command(CallCommand::Reject).await.map(|_| ())
    }

    pub async fn hang_up(&self) -> Result<()> {
        self.command(CallCommand::HangUp).await.map(|_| ())
    }

    pub async fn toggle_audio(&self) -> Result<Option<bool>> {
        self.command(CallCommand::ToggleAudio).await
    }

    pub async fn toggle_video(&self) -> Result<Option<bool>> {
        self.command(CallCommand::ToggleVideo).await
    }

    fn on_incoming_offer(&self, offer: OfferPayload) {
        let busy = {
            let slot = self.slot.lock();
            match &*slot {
                Slot::Active(active) if active.call_id == offer.call_id => return,
                Slot::Free => false,
                _ => true,
            }
        };

        if busy {
            log::info!("Busy, rejecting call {} from {}", offer.call_id, offer.from);
            let reject = CallSignal::RejectCall(CallRef {
                to: offer.from.clone(),
                from: None,
                call_id: offer.call_id.clone(),
            });
            if let Err(e) = self.ctx.transport.send(Frame::Call(reject)) {
                log::warn!("Could not reject call {}: {}", offer.call_id, e);
            }
            return;
        }

        log::info!("Incoming {:?} call {} from {}", offer.call_type, offer.call_id, offer.from);
        let (engine, inputs) = CallEngine::incoming(self.ctx.clone(), offer);
        self.spawn_driver(engine, inputs);
    }

    fn spawn_driver(&self, engine: CallEngine, inputs: CallInputs) {
        let (tx, rx) = mpsc::unbounded_channel();
        let call_id = engine.call_id().to_string();
        *self.slot.lock() = Slot::Active(ActiveCall {
            call_id: call_id.clone(),
            commands: tx,
        });
        self.snapshots.send_replace(Some(engine.snapshot()));

        let driver = Driver {
            engine,
            inputs,
            commands: rx,
            connect_timeout: self.connect_timeout,
            snapshots: self.snapshots.clone(),
        };
        let slot = self.slot.clone();
        tokio::spawn(async move {
            driver.run().await;
            let mut slot = slot.lock();
            if matches!(&*slot, Slot::Active(active) if active.call_id == call_id) {
                *slot = Slot::Free;
            }
        });
    }

    async fn command(&self, command: CallCommand) -> Result<Option<bool>> {
        let commands = match &*self.slot.lock() {
            Slot::Active(active) => active.commands.clone(),
            _ => return Err(Error::InvalidState("no active call".to_string())),
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        commands
            .send((command, reply_tx))
            .map_err(|_| Error::InvalidState("call already ended".to_string()))?;
        reply_rx
            .await
            .map_err(|_| Error::InvalidState("call already ended".to_string()))?
    }
}

impl Drop for CallController {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
        *self.slot.lock() = Slot::Free;
    }
}

struct Driver {
    engine: CallEngine,
    inputs: CallInputs,
    commands: Commands,
    connect_timeout: Duration,
    snapshots: Arc<watch::Sender<Option<CallSnapshot>>>,
}

impl Driver {
    async fn run(mut self) {
        let deadline = tokio::time::sleep(self.connect_timeout);
        tokio::pin!(deadline);

        loop {
            let pending = self.engine.state().is_pending();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some((command, reply)) => {
                        let (result, cut_in) = self.execute(command, deadline.as_mut()).await;
                        self.publish();
                        let _ = reply.send(result);
                        if let Some((reply, result)) = cut_in {
                            let _ = reply.send(result);
                        }
                    }
                    None => {
                        // Controller dropped.
                        let _ = self.engine.hang_up().await;
                        self.publish();
                        break;
                    }
                },
                Some(frame) = self.inputs.signals.recv() => {
                    let _ = self.engine.handle_signal(frame).await;
                }
                Some(event) = self.inputs.peer_events.recv() => {
                    if let Err(e) = self.engine.handle_peer_event(event).await {
                        log::warn!("Call {}: {}", self.engine.call_id(), e);
                    }
                }
                _ = &mut deadline, if pending => self.engine.expire().await,
            }

            self.publish();
            if self.engine.state().is_terminal() {
                break;
            }
        }

        self.engine.teardown().await;
    }

    /// Runs one command. Setup commands wait on media and SDP and can be cut
    /// short by the connect timeout, a hang-up or a reject; the interrupting
    /// command's reply is returned alongside.
    async fn execute(
        &mut self,
        command: CallCommand,
        deadline: Pin<&mut Sleep>,
    ) -> (Result<Option<bool>>, Option<(Reply, Result<Option<bool>>)>) {
        if !matches!(command, CallCommand::Initiate | CallCommand::Accept) {
            return (run_command(&mut self.engine, command).await, None);
        }

        let interruption =
            match run_preemptible(&mut self.engine, &mut self.commands, command, deadline).await {
                Ok(result) => return (result, None),
                Err(interruption) => interruption,
            };

        let aborted = Err(Error::InvalidState(format!(
            "call {} ended during setup",
            self.engine.call_id()
        )));
        match interruption {
            Interruption::Timeout => {
                self.engine.expire().await;
                (aborted, None)
            }
            Interruption::Command(command, reply) => {
                let result = run_command(&mut self.engine, command).await;
                (aborted, Some((reply, result)))
            }
            Interruption::Closed => {
                let _ = self.engine.hang_up().await;
                (aborted, None)
            }
        }
    }

    fn publish(&self) {
        let snapshot = Some(self.engine.snapshot());
        self.snapshots.send_if_modified(|current| {
            if *current != snapshot {
                *current = snapshot;
                true
            } else {
                false
            }
        });
    }
}

async fn run_command(engine: &mut CallEngine, command: CallCommand) -> Result<Option<bool>> {
    match command {
        CallCommand::Initiate => engine.initiate().await.map(|_| None),
        CallCommand::Accept => engine.accept().await.map(|_| None),
        CallCommand::Reject => engine.reject().await.map(|_| None),
        CallCommand::HangUp => engine.hang_up().await.map(|_| None),
        CallCommand::ToggleAudio => Ok(engine.toggle_audio()),
        CallCommand::ToggleVideo => Ok(engine.toggle_video()),
    }
}

/// Drives `command` while still watching the deadline and the command queue.
/// Dropping the command future leaves whatever it already acquired on the
/// engine, where teardown releases it.
async fn run_preemptible(
    engine: &mut CallEngine,
    commands: &mut Commands,
    command: CallCommand,
    mut deadline: Pin<&mut Sleep>,
) -> std::result::Result<Result<Option<bool>>, Interruption> {
    let work = run_command(engine, command);
    tokio::pin!(work);

    loop {
        tokio::select! {
            result = &mut work => return Ok(result),
            _ = &mut deadline => return Err(Interruption::Timeout),
            next = commands.recv() => match next {
                Some((cmd @ (CallCommand::HangUp | CallCommand::Reject), reply)) => {
                    return Err(Interruption::Command(cmd, reply));
                }
                Some((_, reply)) => {
                    let _ = reply.send(Err(Error::InvalidState("call setup in progress".to_string())));
                }
                None => return Err(Interruption::Closed),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaTrack;
    use crate::models::{CallState, EndReason, IceServer, MediaKind};
    use crate::peer::{PeerEvent, PeerState, RemoteTrack};
    use crate::test_support::{FakeData, FakeMedia, FakePeerFactory};
    use crate::transport::{MemoryHub, MemoryTransport, SignalingTransport};

    struct Client {
        transport: Arc<MemoryTransport>,
        peers: Arc<FakePeerFactory>,
        media: Arc<FakeMedia>,
        controller: Arc<CallController>,
    }

    fn client(hub: &MemoryHub, user_id: &str) -> Client {
        let transport = hub.endpoint(user_id);
        let media = Arc::new(FakeMedia::default());
        let peers = Arc::new(FakePeerFactory::default());
        let ctx = CallContext {
            user_id: user_id.to_string(),
            display_name: user_id.to_string(),
            transport: transport.clone(),
            media: media.clone(),
            peers: peers.clone(),
            ice_servers: IceServer::public_defaults(),
        };
        let controller = CallController::new(
            ctx,
            Arc::new(FakeData::new(user_id)),
            Duration::from_secs(45),
        );
        controller.listen();
        Client {
            transport,
            peers,
            media,
            controller,
        }
    }

    async fn wait_for_state(controller: &CallController, state: CallState) -> CallSnapshot {
        let mut rx = controller.snapshots();
        let snapshot = tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|s| s.as_ref().map(|s| s.state) == Some(state)),
        )
        .await
        .expect("timed out waiting for call state")
        .expect("controller dropped");
        snapshot.clone().unwrap()
    }

    #[tokio::test]
    async fn test_two_party_call_through_controllers() {
        let hub = MemoryHub::new();
        let alice = client(&hub, "alice");
        let bob = client(&hub, "bob");

        let call_id = alice
            .controller
            .start_call("bob", "Bob", CallType::Video)
            .await
            .unwrap();
        assert_eq!(alice.controller.current().unwrap().state, CallState::Connecting);

        let ringing = wait_for_state(&bob.controller, CallState::Ringing).await;
        assert_eq!(ringing.call_id, call_id);
        assert_eq!(ringing.peer_id, "alice");

        bob.controller.accept().await.unwrap();
        assert_eq!(bob.controller.current().unwrap().state, CallState::Connecting);

        bob.peers
            .last()
            .emit(PeerEvent::StateChanged(PeerState::Connected));
        wait_for_state(&bob.controller, CallState::Connected).await;

        alice.peers.last().emit(PeerEvent::RemoteTrack(RemoteTrack {
            id: "v0".into(),
            kind: MediaKind::Video,
        }));
        wait_for_state(&alice.controller, CallState::Connected).await;

        assert_eq!(alice.controller.toggle_video().await.unwrap(), Some(false));

        alice.controller.hang_up().await.unwrap();
        let ended = wait_for_state(&bob.controller, CallState::Ended).await;
        assert_eq!(ended.end_reason, Some(EndReason::RemoteHangUp));
        assert!(bob.media.acquired().iter().all(|t| !t.is_live()));
        assert!(alice.media.acquired().iter().all(|t| !t.is_live()));
    }

    #[tokio::test]
    async fn test_second_call_is_refused_while_busy() {
        let hub = MemoryHub::new();
        let alice = client(&hub, "alice");
        let _bob = client(&hub, "bob");

        alice
            .controller
            .start_call("bob", "Bob", CallType::Audio)
            .await
            .unwrap();
        let err = alice
            .controller
            .start_call("carol", "Carol", CallType::Audio)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CallInProgress));
    }

    #[tokio::test]
    async fn test_offer_while_busy_is_rejected() {
        let hub = MemoryHub::new();
        let alice = client(&hub, "alice");
        let _bob = client(&hub, "bob");
        let carol = hub.endpoint("carol");
        let mut carol_call = carol.subscribe(Topic::Call("carol-1".into()));

        alice
            .controller
            .start_call("bob", "Bob", CallType::Audio)
            .await
            .unwrap();

        carol
            .send(Frame::Call(CallSignal::Offer(OfferPayload {
                offer: crate::models::SessionDescription::offer("v=0"),
                to: "alice".into(),
                from: "carol".into(),
                call_id: "carol-1".into(),
                call_type: CallType::Audio,
                caller_name: "Carol".into(),
            })))
            .unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(5), carol_call.events.recv())
            .await
            .unwrap();
        match frame {
            Some(Frame::Call(CallSignal::RejectCall(r))) => assert_eq!(r.from.as_deref(), Some("alice")),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(alice.controller.current().unwrap().peer_id, "bob");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_call_times_out() {
        let hub = MemoryHub::new();
        let alice = client(&hub, "alice");

        alice
            .controller
            .start_call("bob", "Bob", CallType::Audio)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(46)).await;
        let snapshot = alice.controller.current().unwrap();
        assert_eq!(snapshot.state, CallState::Failed);
        assert_eq!(snapshot.end_reason, Some(EndReason::Timeout));
        assert!(matches!(
            alice.transport.sent().last(),
            Some(Frame::Call(CallSignal::EndCall(_)))
        ));

        tokio::task::yield_now().await;
        assert!(!alice.controller.is_busy());
    }

    /// The first snapshot is published once the setup command is queued.
    async fn wait_for_session(controller: &CallController) {
        while controller.current().is_none() {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_media_still_times_out() {
        let hub = MemoryHub::new();
        let alice = client(&hub, "alice");
        alice.media.stall.store(true, std::sync::atomic::Ordering::SeqCst);

        let controller = alice.controller.clone();
        let starting =
            tokio::spawn(async move { controller.start_call("bob", "Bob", CallType::Audio).await });
        wait_for_session(&alice.controller).await;

        tokio::time::sleep(Duration::from_secs(120)).await;
        let snapshot = alice.controller.current().unwrap();
        assert_eq!(snapshot.state, CallState::Failed);
        assert_eq!(snapshot.end_reason, Some(EndReason::Timeout));
        assert!(starting.await.unwrap().is_err());
        assert!(!alice.controller.is_busy());
    }

    #[tokio::test]
    async fn test_hang_up_interrupts_stalled_setup() {
        let hub = MemoryHub::new();
        let alice = client(&hub, "alice");
        alice.media.stall.store(true, std::sync::atomic::Ordering::SeqCst);

        let controller = alice.controller.clone();
        let starting =
            tokio::spawn(async move { controller.start_call("bob", "Bob", CallType::Video).await });
        wait_for_session(&alice.controller).await;
        tokio::task::yield_now().await;

        tokio::time::timeout(Duration::from_secs(5), alice.controller.hang_up())
            .await
            .expect("hang up blocked by call setup")
            .unwrap();
        let snapshot = wait_for_state(&alice.controller, CallState::Ended).await;
        assert_eq!(snapshot.end_reason, Some(EndReason::LocalHangUp));
        assert!(starting.await.unwrap().is_err());

        tokio::time::timeout(Duration::from_secs(5), async {
            while alice.controller.is_busy() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        alice.media.stall.store(false, std::sync::atomic::Ordering::SeqCst);
        alice
            .controller
            .start_call("bob", "Bob", CallType::Audio)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_media_denied_surfaces_and_frees_slot() {
        let hub = MemoryHub::new();
        let alice = client(&hub, "alice");
        alice.media.deny.store(true, std::sync::atomic::Ordering::SeqCst);

        let err = alice
            .controller
            .start_call("bob", "Bob", CallType::Video)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MediaAccessDenied(_)));
        assert_eq!(
            alice.controller.current().unwrap().end_reason,
            Some(EndReason::MediaAccessDenied)
        );

        tokio::time::timeout(Duration::from_secs(5), async {
            while alice.controller.is_busy() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_commands_without_call_fail() {
        let hub = MemoryHub::new();
        let alice = client(&hub, "alice");
        assert!(matches!(
            alice.controller.accept().await,
            Err(Error::InvalidState(_))
        ));
        assert!(alice.transport.is_connected());
    }
}
