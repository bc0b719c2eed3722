use std::{
    fmt::Debug,
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use futures::FutureExt;
use tokio::{
    io::AsyncWrite,
    sync::{mpsc, OwnedMutexGuard},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    at::{
        callback::{self, CallbackQueue},
        delimiter_byte,
        exchange::AtExchange,
        receiver::{Ingress, Receiver},
        urc::{self, Urc, UrcRegistry},
        AtOptions, Settings,
    },
    error::{DeviceError, Error},
    queue::QueueContext,
    transport::Transport,
};

pub(crate) type Writer = Box<dyn AsyncWrite + Send + Unpin>;

type TimeoutCallback = Arc<dyn Fn(&AtClient, u32) + Send + Sync>;

static NEXT_CLIENT_ID: AtomicU32 = AtomicU32::new(0);

/// State shared between a client and its receive task.
pub(crate) struct Shared {
    settings: Mutex<Settings>,
    urcs: Mutex<UrcRegistry>,
}

impl Shared {
    pub(crate) fn settings(&self) -> MutexGuard<'_, Settings> {
        self.settings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn urcs(&self) -> MutexGuard<'_, UrcRegistry> {
        self.urcs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Default)]
struct State {
    device_error: Option<DeviceError>,
    consecutive_timeouts: u32,
    last_exchange_end: Option<Instant>,
    timeout_callback: Option<TimeoutCallback>,
}

pub(crate) struct Inner {
    id: u32,
    line_capacity: usize,
    writer: Arc<tokio::sync::Mutex<Writer>>,
    ingress: mpsc::UnboundedSender<Ingress>,
    shared: Arc<Shared>,
    state: Mutex<State>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    pub(crate) callbacks: CallbackQueue,
    closed: AtomicBool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // The callback task exits by itself once its queue is gone.
        let tasks = self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

/// An AT client on top of a byte stream.
///
/// Clones refer to the same client.
/// Talking to the module happens in an [`AtExchange`], obtained with
/// [`AtClient::lock`]; only one exchange can be in flight at a time.
///
/// The client must be added from within a tokio runtime.
#[derive(Clone)]
pub struct AtClient {
    inner: Arc<Inner>,
}

impl Debug for AtClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtClient")
            .field("id", &self.inner.id)
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl AtClient {
    /// Add a client on top of `transport`.
    ///
    /// Starts the receive task, and a task for running callbacks
    /// whose queue is created in `ctx`.
    pub fn add<T: Transport>(
        ctx: &QueueContext,
        transport: T,
        options: AtOptions,
    ) -> Result<Self, Error> {
        let settings = Settings::try_from(&options)?;
        let callbacks = CallbackQueue::new(ctx, options.callback_queue_depth)?;

        let id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
        let (reader, writer) = tokio::io::split(transport);
        let (ingress, ingress_receiver) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            settings: Mutex::new(settings),
            urcs: Mutex::new(UrcRegistry::default()),
        });

        let receiver = Receiver::new(
            reader,
            ingress_receiver,
            shared.clone(),
            options.line_capacity,
        );

        let writer: Writer = Box::new(writer);
        let callback_ctx = callbacks.context();
        let callback_handle = callbacks.handle();

        let inner = Arc::new(Inner {
            id,
            line_capacity: options.line_capacity,
            writer: Arc::new(tokio::sync::Mutex::new(writer)),
            ingress,
            shared,
            state: Mutex::new(State::default()),
            tasks: Mutex::new(vec![]),
            callbacks,
            closed: AtomicBool::new(false),
        });

        let receive_task =
            tokio::spawn(receiver.run().instrument(info_span!("at-rx", client = id)));
        let callback_task = tokio::spawn(
            callback::run(callback_ctx, callback_handle, Arc::downgrade(&inner))
                .instrument(info_span!("at-callbacks", client = id)),
        );

        inner.tasks().extend([receive_task, callback_task]);

        info!(client = id, ?options, "AT client added");

        Ok(Self { inner })
    }

    pub(crate) fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    pub(crate) fn id(&self) -> u32 {
        self.inner.id
    }

    pub(crate) fn line_capacity(&self) -> usize {
        self.inner.line_capacity
    }

    /// Remove the client.
    ///
    /// Waits for an exchange in flight to finish.
    /// Stops the tasks, drops queued callbacks and URC handlers.
    /// Other clones of this client fail with [`Error::Closed`] afterwards.
    pub async fn remove(self) -> Result<(), Error> {
        if urc::in_urc_handler() {
            return Err(Error::Reentrant);
        }

        let _writer = self.inner.writer.lock().await;

        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Err(Error::Closed);
        }

        self.inner.shared.urcs().clear();
        self.inner.callbacks.close();

        for task in self.inner.tasks().drain(..) {
            task.abort();
        }

        info!(client = self.inner.id, "AT client removed");
        Ok(())
    }

    /// Start an exchange, waiting for any other one to finish first.
    ///
    /// Fails with [`Error::Reentrant`] from within a URC handler;
    /// use [`AtClient::callback`] there instead.
    pub async fn lock(&self) -> Result<AtExchange, Error> {
        if urc::in_urc_handler() {
            return Err(Error::Reentrant);
        }
        self.check_open()?;

        let writer = self.inner.writer.clone().lock_owned().await;
        self.check_open()?;

        Ok(self.begin(writer))
    }

    /// Start an exchange if no other one is in flight.
    pub fn try_lock(&self) -> Result<AtExchange, Error> {
        if urc::in_urc_handler() {
            return Err(Error::Reentrant);
        }
        self.check_open()?;

        let writer = self
            .inner
            .writer
            .clone()
            .try_lock_owned()
            .map_err(|_| Error::Busy("another AT exchange is in flight".into()))?;

        Ok(self.begin(writer))
    }

    fn begin(&self, writer: OwnedMutexGuard<Writer>) -> AtExchange {
        let _ = self.inner.ingress.send(Ingress::Begin);
        let settings = self.inner.shared.settings().clone();

        AtExchange::new(self.clone(), writer, settings)
    }

    fn check_open(&self) -> Result<(), Error> {
        if self.inner.closed.load(Ordering::SeqCst) {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn send(&self, ingress: Ingress) -> Result<(), Error> {
        self.inner.ingress.send(ingress).map_err(|_| Error::Closed)
    }

    /// Sleep until the command delay since the last exchange has passed.
    pub(crate) async fn wait_command_delay(&self, delay: Duration) {
        let last = self.state().last_exchange_end;

        if let Some(last) = last {
            tokio::time::sleep_until(last + delay).await;
        }
    }

    pub(crate) fn record_device_error(&self, error: DeviceError) {
        self.state().device_error = Some(error);
    }

    /// Book-keeping once an exchange is over.
    pub(crate) fn exchange_ended(&self, error: Option<&Error>) {
        let (timeouts, callback) = {
            let mut state = self.state();
            state.last_exchange_end = Some(Instant::now());

            if matches!(error, Some(Error::Timeout)) {
                state.consecutive_timeouts += 1;
            } else {
                state.consecutive_timeouts = 0;
            }

            (state.consecutive_timeouts, state.timeout_callback.clone())
        };

        if timeouts > 0 {
            warn!(client = self.inner.id, timeouts, "Exchange timed out");

            if let Some(callback) = callback {
                callback(self, timeouts);
            }
        }
    }

    /// The error the module reported at the end of the last exchange which
    /// ended in one.
    pub fn device_error(&self) -> Option<DeviceError> {
        self.state().device_error.clone()
    }

    /// Called after every exchange which timed out, with the number of
    /// exchanges in a row which did.
    ///
    /// Runs on the task which finished the exchange, and must not start one.
    pub fn set_timeout_callback<F>(&self, callback: F)
    where
        F: Fn(&AtClient, u32) + Send + Sync + 'static,
    {
        self.state().timeout_callback = Some(Arc::new(callback));
    }

    /// How long exchanges started from now on may take.
    pub fn set_timeout(&self, timeout: Duration) {
        self.inner.shared.settings().timeout = timeout;
    }

    /// How long exchanges may take.
    pub fn timeout(&self) -> Duration {
        self.inner.shared.settings().timeout
    }

    /// Change the parameter delimiter.
    pub fn set_delimiter(&self, delimiter: char) -> Result<(), Error> {
        self.inner.shared.settings().delimiter = delimiter_byte(delimiter)?;
        Ok(())
    }

    /// Turn echo suppression on or off.
    pub fn set_echo_suppression(&self, suppress: bool) {
        self.inner.shared.settings().echo_suppression = suppress;
    }

    /// Least time between the end of an exchange and the next command.
    pub fn set_command_delay(&self, delay: Duration) {
        self.inner.shared.settings().command_delay = delay;
    }

    /// Log AT traffic at info level.
    pub fn set_print_at(&self, print: bool) {
        self.inner.shared.settings().print_at = print;
    }

    /// Call `handler` for each line starting with `prefix` which is not part
    /// of a response.
    ///
    /// Handlers run on the receive task: they must be quick and can not
    /// start exchanges (those fail with [`Error::Reentrant`]).
    /// Queue a [`AtClient::callback`] for anything more.
    ///
    /// Setting a handler for a prefix which has one replaces it.
    /// Prefixes are matched in the order they were first set.
    pub fn set_urc_handler<F>(&self, prefix: &str, handler: F) -> Result<(), Error>
    where
        F: Fn(&mut Urc) + Send + Sync + 'static,
    {
        if prefix.is_empty() {
            return Err(Error::InvalidParameter("empty URC prefix".into()));
        }
        self.check_open()?;

        let replaced = self
            .inner
            .shared
            .urcs()
            .set(prefix.as_bytes(), Arc::new(handler));

        if replaced {
            debug!(prefix, "URC handler replaced");
        }
        Ok(())
    }

    /// Stop handling a URC prefix.
    pub fn remove_urc_handler(&self, prefix: &str) -> Result<(), Error> {
        if self.inner.shared.urcs().remove(prefix.as_bytes()) {
            Ok(())
        } else {
            Err(Error::NotFound(format!("no URC handler for {prefix:?}")))
        }
    }

    /// Queue `callback` to run on the callback task, which may start exchanges.
    ///
    /// Does not wait, so can be used from URC handlers.
    /// Fails with [`Error::Busy`] when too many callbacks are queued.
    pub fn callback<F, Fut>(&self, callback: F) -> Result<(), Error>
    where
        F: FnOnce(AtClient) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.check_open()?;

        self.inner
            .callbacks
            .push(Box::new(move |client| callback(client).boxed()))
    }

    /// Drop whatever has been received but not consumed.
    pub fn flush(&self) -> Result<(), Error> {
        self.send(Ingress::Flush)
    }

    /// Send a command which has no information response.
    pub async fn command(&self, command: &str) -> Result<(), Error> {
        let mut exchange = self.lock().await?;

        exchange.command_start(command)?;
        exchange.command_stop().await?;
        exchange.response_stop().await?;

        exchange.unlock()
    }

    /// Send a command, returning the lines of its response (without the
    /// stop tag).
    pub async fn command_lines(&self, command: &str) -> Result<Vec<String>, Error> {
        let mut exchange = self.lock().await?;
        let mut lines = vec![];

        exchange.command_start(command)?;
        exchange.command_stop().await?;

        while exchange.response_start(None).await? {
            lines.push(exchange.read_remaining()?);
        }
        exchange.response_stop().await?;

        exchange.unlock()?;
        Ok(lines)
    }
}

impl Inner {
    fn tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
