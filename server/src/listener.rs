//! Accept connections and keep a fixed number of handlers armed.
//!
//! A [Listener] owns the listening socket and a registry of [Handler]s keyed by
//! [SocketId]. On [Listener::start], it creates `capacity` handlers, each of which
//! immediately arms an accept. Whenever a handler retires, the listener removes it from
//! the registry and arms a replacement, so (until [Listener::stop]) exactly `capacity`
//! handlers are always either waiting for a connection or serving one.

use crate::{
    driver::{Driver, SocketId},
    executor::Executor,
    handler::{Context, Handler},
    metrics::Metrics,
    Config, Error, Protocol, State,
};
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, Weak,
    },
};
use tracing::{debug, info, warn};

type Factory<P> = Box<dyn Fn() -> P + Send + Sync>;

/// Serves a [Protocol] on every connection accepted from one address.
pub struct Listener<D: Driver, P: Protocol> {
    context: Arc<Context<D>>,
    factory: Factory<P>,
    this: Weak<Self>,

    socket: Mutex<Option<(SocketId, SocketAddr)>>,
    handlers: Mutex<HashMap<SocketId, Arc<Handler<D, P>>>>,

    started: AtomicBool,
    stopping: AtomicBool,
}

impl<D: Driver, P: Protocol> Listener<D, P> {
    /// Create a listener that submits operations to `driver`, processes their completions
    /// on `executor`, and creates one protocol instance per handler with `factory`.
    pub fn new(
        cfg: Config,
        driver: Arc<D>,
        executor: Arc<dyn Executor>,
        factory: impl Fn() -> P + Send + Sync + 'static,
    ) -> Result<Arc<Self>, Error> {
        cfg.validate()?;
        let metrics = Metrics::init(&mut cfg.registry.lock().unwrap());
        let context = Arc::new(Context {
            driver,
            executor,
            cfg,
            metrics,
        });
        Ok(Arc::new_cyclic(|this| Self {
            context,
            factory: Box::new(factory),
            this: this.clone(),
            socket: Mutex::new(None),
            handlers: Mutex::new(HashMap::new()),
            started: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
        }))
    }

    /// Listen on the configured address and arm `capacity` handlers.
    ///
    /// Returns the address actually bound.
    pub fn start(&self) -> Result<SocketAddr, Error> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted);
        }
        let (socket, address) = match self.context.driver.listen(self.context.cfg.address) {
            Ok(listening) => listening,
            Err(err) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };
        *self.socket.lock().unwrap() = Some((socket, address));

        let capacity = self.context.cfg.capacity;
        let armed = (0..capacity).take_while(|_| self.add_new_handler()).count();
        if armed < capacity {
            warn!(armed, capacity, "unable to arm every connection handler");
        }
        info!(%address, capacity, "listening");
        Ok(address)
    }

    /// Pair one accept request with `handler`.
    pub fn accept(&self, handler: &Arc<Handler<D, P>>) {
        let socket = self.socket.lock().unwrap().map(|(socket, _)| socket);
        match socket {
            Some(socket) => handler.arm_accept(socket),
            None => handler.stop(),
        }
    }

    /// Create, register, and arm one handler.
    ///
    /// Returns false once the listener is stopping (or if the handler could not be created).
    pub fn add_new_handler(&self) -> bool {
        if self.stopping.load(Ordering::SeqCst) {
            return false;
        }
        let id = match self.context.driver.open() {
            Ok(id) => id,
            Err(err) => {
                warn!(?err, "unable to open socket");
                return false;
            }
        };
        let handler = Handler::new(id, self.context.clone(), self.this.clone(), (self.factory)());
        {
            let mut handlers = self.handlers.lock().unwrap();
            if self.stopping.load(Ordering::SeqCst) {
                drop(handlers);
                self.context.driver.close(id);
                return false;
            }
            handlers.insert(id, handler.clone());
        }
        self.accept(&handler);
        true
    }

    /// Remove `handler` from the registry, returning false if it was not registered.
    pub fn remove_handler(&self, handler: &Arc<Handler<D, P>>) -> bool {
        let mut handlers = self.handlers.lock().unwrap();
        match handlers.get(&handler.id()) {
            Some(registered) if Arc::ptr_eq(registered, handler) => {
                handlers.remove(&handler.id());
                true
            }
            _ => false,
        }
    }

    /// Unregister a retired handler and arm its replacement.
    pub(crate) fn destroy(&self, handler: &Arc<Handler<D, P>>) {
        if !self.remove_handler(handler) {
            warn!(socket = %handler.id(), "unable to remove connection handler");
        }
        if !self.add_new_handler() && !self.stopping.load(Ordering::SeqCst) {
            warn!("unable to add new connection handler");
        }
    }

    /// Stop every handler and close the listening socket. Idempotent.
    ///
    /// Handlers retire asynchronously (as their cancelled operations complete).
    pub fn stop(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        let handlers = self
            .handlers
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect::<Vec<_>>();
        debug!(handlers = handlers.len(), "stopping listener");
        for handler in handlers {
            handler.stop();
        }
        if let Some((socket, _)) = *self.socket.lock().unwrap() {
            self.context.driver.close(socket);
        }
    }

    /// Stop the handler registered for `id`.
    pub fn stop_handler(&self, id: SocketId) -> Result<(), Error> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(Error::NotStarted);
        }
        let handler = self.handler(id).ok_or(Error::UnknownSocket(id))?;
        handler.stop();
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.stopping.load(Ordering::SeqCst)
    }

    /// Address the listener is bound to (once started).
    pub fn local_address(&self) -> Option<SocketAddr> {
        self.socket.lock().unwrap().map(|(_, address)| address)
    }

    /// Number of registered handlers.
    pub fn handlers(&self) -> usize {
        self.handlers.lock().unwrap().len()
    }

    /// Number of handlers serving an accepted connection.
    pub fn connections(&self) -> usize {
        self.count(|state| !matches!(state, State::Disconnected | State::Stopped))
    }

    /// Number of handlers waiting for a connection.
    pub fn pending_accepts(&self) -> usize {
        self.count(|state| state == State::Disconnected)
    }

    pub fn handler(&self, id: SocketId) -> Option<Arc<Handler<D, P>>> {
        self.handlers.lock().unwrap().get(&id).cloned()
    }

    fn count(&self, filter: impl Fn(State) -> bool) -> usize {
        let handlers = self.handlers.lock().unwrap();
        handlers
            .values()
            .filter(|handler| filter(handler.state()))
            .count()
    }
}

impl<D: Driver, P: Protocol> Drop for Listener<D, P> {
    fn drop(&mut self) {
        self.stop();
    }
}
