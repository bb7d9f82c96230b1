use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};

use crate::error::SessionError;
use crate::websocket::handshake::UpgradeResponse;
use crate::websocket::session::Session;

#[allow(unused_variables)]
pub trait SessionObserver: Send + Sync {
    fn did_connect(&self, session: &Session) {}

    fn did_disconnect(&self, session: &Session, error: Option<&SessionError>) {}

    fn did_receive_message(&self, session: &Session, text: &str, response: &UpgradeResponse) {}

    fn did_receive_data(&self, session: &Session, data: &[u8], response: &UpgradeResponse) {}

    fn http_upgrade_request(&self, session: &Session, request: &str) {}

    fn http_upgrade_response(&self, session: &Session, response: &str) {}
}

type ConnectFn = Arc<dyn Fn() + Send + Sync>;
type TextFn = Arc<dyn Fn(&str) + Send + Sync>;
type DataFn = Arc<dyn Fn(&[u8]) + Send + Sync>;
type DisconnectFn = Arc<dyn Fn(Option<&SessionError>) + Send + Sync>;

#[derive(Default, Clone)]
struct Callbacks {
    on_connect: Option<ConnectFn>,
    on_text: Option<TextFn>,
    on_data: Option<DataFn>,
    on_disconnect: Option<DisconnectFn>,
}

#[derive(Default)]
struct Fired {
    connect: bool,
    disconnect: bool,
}

#[derive(Default)]
pub struct Dispatcher {
    observer: RwLock<Option<Weak<dyn SessionObserver>>>,
    callbacks: RwLock<Callbacks>,
    fired: Mutex<Fired>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    // Weak: dropping the last `Arc` detaches the observer.
    pub fn set_observer<O>(&self, observer: &Arc<O>)
    where
        O: SessionObserver + 'static,
    {
        let weak: Weak<dyn SessionObserver> = Arc::downgrade(observer) as Weak<dyn SessionObserver>;
        *self.observer.write() = Some(weak);
    }

    pub fn clear_observer(&self) {
        *self.observer.write() = None;
    }

    pub fn set_on_connect(&self, f: impl Fn() + Send + Sync + 'static) {
        self.callbacks.write().on_connect = Some(Arc::new(f));
    }

    pub fn set_on_text(&self, f: impl Fn(&str) + Send + Sync + 'static) {
        self.callbacks.write().on_text = Some(Arc::new(f));
    }

    pub fn set_on_data(&self, f: impl Fn(&[u8]) + Send + Sync + 'static) {
        self.callbacks.write().on_data = Some(Arc::new(f));
    }

    pub fn set_on_disconnect(&self, f: impl Fn(Option<&SessionError>) + Send + Sync + 'static) {
        self.callbacks.write().on_disconnect = Some(Arc::new(f));
    }

    fn observer(&self) -> Option<Arc<dyn SessionObserver>> {
        self.observer.read().as_ref().and_then(Weak::upgrade)
    }

    fn callbacks(&self) -> Callbacks {
        self.callbacks.read().clone()
    }

    pub fn http_upgrade_request(&self, session: &Session, request: &str) {
        if let Some(observer) = self.observer() {
            observer.http_upgrade_request(session, request);
        }
    }

    pub fn http_upgrade_response(&self, session: &Session, response: &UpgradeResponse) {
        if let Some(observer) = self.observer() {
            observer.http_upgrade_response(session, response.raw());
        }
    }

    pub fn connect(&self, session: &Session) -> bool {
        {
            let mut fired = self.fired.lock();
            if fired.connect || fired.disconnect {
                return false;
            }
            fired.connect = true;
        }
        if let Some(observer) = self.observer() {
            observer.did_connect(session);
        }
        if let Some(f) = self.callbacks().on_connect {
            f();
        }
        true
    }

    pub fn text(&self, session: &Session, text: &str, response: &UpgradeResponse) {
        if let Some(observer) = self.observer() {
            observer.did_receive_message(session, text, response);
        }
        if let Some(f) = self.callbacks().on_text {
            f(text);
        }
    }

    pub fn data(&self, session: &Session, data: &[u8], response: &UpgradeResponse) {
        if let Some(observer) = self.observer() {
            observer.did_receive_data(session, data, response);
        }
        if let Some(f) = self.callbacks().on_data {
            f(data);
        }
    }

    // Later calls are no-ops and return false.
    pub fn disconnect(&self, session: &Session, error: Option<&SessionError>) -> bool {
        {
            let mut fired = self.fired.lock();
            if fired.disconnect {
                return false;
            }
            fired.disconnect = true;
        }
        if let Some(observer) = self.observer() {
            observer.did_disconnect(session, error);
        }
        if let Some(f) = self.callbacks().on_disconnect {
            f(error);
        }
        true
    }
}
