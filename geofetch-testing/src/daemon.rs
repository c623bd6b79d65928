use geofetch_logic::{
    Accuracy, AuthorizationMode, AuthorizationStatus, CancelHandle, LocationProvider, Locator,
    LocatorSettings, ProviderEvent, RequestId,
};
use geofetch_test_shared::*;
use interprocess::local_socket::{
    ListenerOptions,
    tokio::{Stream, prelude::*},
};
use log::{debug, error, info, warn};
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex as StdMutex,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    sync::{Mutex, mpsc},
    task::JoinSet,
};

/// Provider whose events come from the driver instead of hardware
struct SimulatedProvider {
    tx: mpsc::UnboundedSender<ProviderEvent>,
    rx: Mutex<mpsc::UnboundedReceiver<ProviderEvent>>,
    status: StdMutex<AuthorizationStatus>,
    running: AtomicBool,
}

impl SimulatedProvider {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
            status: StdMutex::new(AuthorizationStatus::NotDetermined),
            running: AtomicBool::new(false),
        }
    }

    fn inject(&self, req: ProviderRequest) -> Result {
        let event = match req {
            ProviderRequest::Fix(location) => ProviderEvent::Location(location),
            ProviderRequest::Error(err) => ProviderEvent::Error(err),
            ProviderRequest::Authorization(status) => {
                *self
                    .status
                    .lock()
                    .map_err(|_| anyhow!("Status lock poisoned"))? = status;
                ProviderEvent::AuthorizationChanged(status)
            }
        };
        self.tx
            .send(event)
            .context("Coordinator is no longer listening")
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl LocationProvider for SimulatedProvider {
    async fn start_updates(&self, accuracy: Accuracy) {
        info!("Simulated hardware started at {accuracy:?}");
        self.running.store(true, Ordering::SeqCst);
    }

    async fn stop_updates(&self) {
        info!("Simulated hardware stopped");
        self.running.store(false, Ordering::SeqCst);
    }

    async fn receive_events(&self) -> impl Iterator<Item = ProviderEvent> + Send {
        let mut rx = self.rx.lock().await;
        let mut buf = Vec::with_capacity(8);
        rx.recv_many(&mut buf, 8).await;
        buf.into_iter()
    }

    fn authorization_status(&self) -> AuthorizationStatus {
        self.status
            .lock()
            .map(|status| *status)
            .unwrap_or(AuthorizationStatus::NotDetermined)
    }

    async fn request_authorization(&self, mode: AuthorizationMode) {
        info!("Authorization prompt shown for {mode:?}, answer with a provider authorization request");
    }
}

type DaemonLocator = Locator<SimulatedProvider>;

/// Where a connection's replies go, each connection only sees answers to its own requests
type Responses = mpsc::UnboundedSender<TestingResponse>;

fn push_resp(responses: &Responses, resp: impl Into<TestingResponse>) {
    if responses.send(resp.into()).is_err() {
        warn!("Connection went away, dropping response");
    }
}

type StateHandle = Arc<Mutex<DaemonState>>;

struct DaemonState {
    locator: DaemonLocator,
    provider: Arc<SimulatedProvider>,
    handles: HashMap<RequestId, CancelHandle>,
}

impl DaemonState {
    pub fn new(settings: LocatorSettings) -> Self {
        let provider = Arc::new(SimulatedProvider::new());
        let locator = DaemonLocator::spawn(provider.clone(), settings);
        Self {
            locator,
            provider,
            handles: HashMap::new(),
        }
    }

    async fn accuracy_or_default(&self, accuracy: Option<Accuracy>) -> Accuracy {
        match accuracy {
            Some(accuracy) => accuracy,
            None => self.locator.settings().await.default_accuracy,
        }
    }

    async fn refresh(&mut self, accuracy: Option<Accuracy>, responses: &Responses) {
        let accuracy = self.accuracy_or_default(accuracy).await;
        let pending = self.locator.refresh_with_accuracy(accuracy).await;
        let id = pending.id();

        self.handles.retain(|_, handle| !handle.is_resolved());
        self.handles.insert(id, pending.handle());
        push_resp(responses, TestingResponse::Pending(id));

        let responses = responses.clone();
        tokio::spawn(async move {
            let outcome = pending.outcome().await;
            debug!("Request {id} resolved with {outcome:?}");
            push_resp(&responses, TestingResponse::Outcome(id, outcome));
        });
    }

    fn cancel(&mut self, id: RequestId) -> Result<(), TestingResponse> {
        let handle = self
            .handles
            .get(&id)
            .ok_or_else(|| TestingResponse::Error(format!("No pending request with id {id}")))?;
        handle.cancel();
        Ok(())
    }

    /// The answer may need requests from other connections, so wait for it off the
    /// connection's loop
    async fn request_authorization(&self, responses: &Responses) {
        let coordinator = self.locator.coordinator();
        let mode = self.locator.authorization_mode().await;
        let responses = responses.clone();
        tokio::spawn(async move {
            let resp = match coordinator.request_authorization(mode).await {
                Ok(status) => TestingResponse::Authorization(status),
                Err(why) => why.into(),
            };
            push_resp(&responses, resp);
        });
    }

    async fn status(&self) -> LocatorStatus {
        LocatorStatus {
            current_location: self.locator.current_location().await,
            is_fetching: self.locator.is_fetching().await,
            has_requested_authorization: self.locator.has_requested_location_authorization().await,
            authorization: self.locator.authorization_state().await,
            provider_running: self.provider.is_running(),
            settings: self.locator.settings().await,
        }
    }

    pub async fn process_req(
        &mut self,
        req: TestingRequest,
        responses: &Responses,
    ) -> Result<(), TestingResponse> {
        match req {
            TestingRequest::Refresh(accuracy) => {
                self.refresh(accuracy, responses).await;
            }
            TestingRequest::Fetch(accuracy) => {
                let accuracy = self.accuracy_or_default(accuracy).await;
                self.locator.fetch(accuracy).await;
                push_resp(responses, TestingResponse::Complete);
            }
            TestingRequest::Cancel(id) => {
                self.cancel(id)?;
                push_resp(responses, TestingResponse::Complete);
            }
            TestingRequest::RequestAuthorization => {
                self.request_authorization(responses).await;
            }
            TestingRequest::UpdateSettings(settings) => {
                self.locator.update_settings(settings).await;
                push_resp(responses, TestingResponse::Complete);
            }
            TestingRequest::Status => {
                let status = self.status().await;
                push_resp(responses, status);
            }
            TestingRequest::Provider(req) => {
                self.provider.inject(req)?;
                push_resp(responses, TestingResponse::Complete);
            }
        }
        Ok(())
    }

    pub async fn shutdown(self) -> Result {
        self.locator.shutdown().await
    }
}

async fn write_resp(send: &mut (impl AsyncWrite + Unpin), resp: &TestingResponse) -> Result {
    let mut encoded = serde_json::to_vec(resp).context("Failed to encode response")?;
    encoded.push(b'\n');
    send.write_all(&encoded)
        .await
        .context("Failed to send response")
}

/// Serve a single driver until it hangs up
async fn serve(handle: StateHandle, stream: Stream) -> Result {
    let (resp_tx, mut resp_rx) = mpsc::unbounded_channel::<TestingResponse>();
    let mut recv = BufReader::new(&stream);
    let mut send = &stream;

    let mut buffer = String::with_capacity(256);

    loop {
        tokio::select! {
            res = recv.read_line(&mut buffer) => {
                match res.context("Failed to read request")? {
                    0 => {
                        break;
                    }
                    _amnt => {
                        let parsed = serde_json::from_str::<TestingRequest>(&buffer);
                        buffer.clear();
                        let res = match parsed {
                            Ok(req) => handle.lock().await.process_req(req, &resp_tx).await,
                            Err(why) => Err(TestingResponse::Error(format!("Bad request: {why}"))),
                        };
                        if let Err(resp) = res {
                            write_resp(&mut send, &resp).await?;
                        }
                    }
                }
            }
            Some(resp) = resp_rx.recv() => {
                write_resp(&mut send, &resp).await?;
            }
        }
    }

    Ok(())
}

fn load_settings(path: Option<&String>) -> Result<LocatorSettings> {
    let Some(path) = path else {
        return Ok(LocatorSettings::default());
    };
    let raw = std::fs::read_to_string(path).with_context(|| format!("Failed to read {path}"))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse settings in {path}"))
}

const CLI_MSG: &str = "Usage: geofetch-test-daemon SOCKET_NAME [SETTINGS_JSON]";

#[tokio::main(flavor = "current_thread")]
pub async fn main() -> Result {
    colog::init();

    let args = std::env::args().collect::<Vec<_>>();
    let raw_socket_name = args.get(1).cloned().context(CLI_MSG)?;
    let settings = load_settings(args.get(2))?;
    let socket_name = get_socket_name(raw_socket_name)?;
    let opts = ListenerOptions::new().name(socket_name);
    let listener = opts.create_tokio().context("Failed to bind to socket")?;

    debug!("Starting with {settings:?}");
    let handle = Arc::new(Mutex::new(DaemonState::new(settings)));
    let mut connections = JoinSet::new();

    info!("Testing daemon ready");

    loop {
        tokio::select! {
            res = listener.accept() => {
                match res {
                    Ok(stream) => {
                        let handle = handle.clone();
                        connections.spawn(async move {
                            if let Err(why) = serve(handle, stream).await {
                                error!("Connection failed: {why:?}");
                            }
                        });
                    }
                    Err(why) => error!("Error from connection: {why:?}"),
                }
            }
            Some(res) = connections.join_next() => {
                if let Err(why) = res {
                    error!("Connection task panicked: {why:?}");
                }
            }
            Ok(_) = tokio::signal::ctrl_c() => {
                break;
            }
        }
    }

    info!("Shutting down");
    connections.shutdown().await;
    let state = Arc::try_unwrap(handle)
        .map_err(|_| anyhow!("Daemon state still in use after closing connections"))?
        .into_inner();
    state.shutdown().await
}
