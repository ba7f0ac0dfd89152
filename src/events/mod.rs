//! Typed publish/subscribe registry connecting meter readings to their consumers.
//!
//! Producers call [`EventBus::trigger`], every registered listener whose filter
//! accepts the event gets it on its own tokio task. Delivery order across
//! listeners is not defined and a slow listener never blocks the producer or
//! the other listeners.

use async_trait::async_trait;
use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

pub mod values;

pub use values::{
    match_role, match_source, BatteryMeterValues, ElectricityCostValues, ElectricityCosts,
    ElectricityMeterValues, ElectricityValues, EventBuses, GasMeterValues, MeterValues,
    SourceEvent, WaterMeterValues,
};

#[async_trait]
pub trait Listener<E>: Send + Sync {
    async fn on_event(&self, event: Arc<E>);
}

/// Predicate deciding if a listener wants an event, `None` on registration means "always"
pub type Filter<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// Identity of a registered listener, derived from the address of its `Arc`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(usize);

impl ListenerId {
    pub fn of<E>(listener: &Arc<dyn Listener<E>>) -> Self {
        return ListenerId(Arc::as_ptr(listener) as *const () as usize);
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum EventError {
    #[error("listener is already registered, deregister it first")]
    AlreadyRegistered,
}

struct Registration<E> {
    listener: Arc<dyn Listener<E>>,
    filter: Option<Filter<E>>,
}

impl<E> Clone for Registration<E> {
    fn clone(&self) -> Self {
        return Registration { listener: self.listener.clone(), filter: self.filter.clone() };
    }
}

pub struct EventBus<E> {
    name: &'static str,
    listeners: Mutex<HashMap<ListenerId, Registration<E>>>,
}

impl<E: Send + Sync + 'static> EventBus<E> {
    pub fn new(name: &'static str) -> Self {
        return EventBus { name, listeners: Mutex::new(HashMap::new()) };
    }

    pub fn name(&self) -> &'static str {
        return self.name;
    }

    pub fn register(&self, listener: Arc<dyn Listener<E>>, filter: Option<Filter<E>>) -> Result<ListenerId, EventError> {
        let id = ListenerId::of(&listener);
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        if listeners.contains_key(&id) {
            return Err(EventError::AlreadyRegistered);
        }

        listeners.insert(id, Registration { listener, filter });
        debug!("{}: listener registered, {} in total", self.name, listeners.len());
        return Ok(id);
    }

    /// Returns false if the listener was not registered
    pub fn deregister(&self, listener: &Arc<dyn Listener<E>>) -> bool {
        let id = ListenerId::of(listener);
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        return listeners.remove(&id).is_some();
    }

    pub fn listener_count(&self) -> usize {
        return self.listeners.lock().unwrap_or_else(|e| e.into_inner()).len();
    }

    /// Hands the event to every accepting listener and returns how many deliveries were started.
    ///
    /// Works on a copy of the registrations taken at call time, a listener
    /// registered concurrently may or may not see this event. Must be called
    /// from within a tokio runtime.
    pub fn trigger(&self, event: E) -> usize {
        let registrations: Vec<Registration<E>> = {
            let listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
            listeners.values().cloned().collect()
        };

        let event = Arc::new(event);
        let mut delivered = 0;
        for reg in registrations {
            if let Some(filter) = &reg.filter {
                if !filter(&event) {
                    continue;
                }
            }

            let ev = event.clone();
            tokio::spawn(async move {
                reg.listener.on_event(ev).await;
            });
            delivered += 1;
        }

        debug!("{}: event handed to {} listeners", self.name, delivered);
        return delivered;
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{settle, Recorder};
    use super::*;

    #[derive(Debug)]
    struct Reading {
        source: String,
        value: i32,
    }

    fn reading(source: &str, value: i32) -> Reading {
        return Reading { source: source.to_string(), value };
    }

    #[tokio::test]
    async fn test_unfiltered_delivery() {
        let bus: EventBus<Reading> = EventBus::new("test");
        let rec = Recorder::<Reading>::new();
        bus.register(rec.clone(), None).unwrap();

        assert_eq!(bus.trigger(reading("grid", 1)), 1);
        settle().await;
        assert_eq!(rec.count().await, 1);
        assert_eq!(rec.received.lock().await[0].value, 1);
    }

    #[tokio::test]
    async fn test_filter_rejects_and_accepts() {
        let bus: EventBus<Reading> = EventBus::new("test");
        let rec = Recorder::<Reading>::new();
        let filter: Filter<Reading> = Arc::new(|r: &Reading| r.source == "pv");
        bus.register(rec.clone(), Some(filter)).unwrap();

        assert_eq!(bus.trigger(reading("grid", 1)), 0);
        settle().await;
        assert_eq!(rec.count().await, 0);

        assert_eq!(bus.trigger(reading("pv", 2)), 1);
        settle().await;
        assert_eq!(rec.count().await, 1);
        assert_eq!(rec.received.lock().await[0].source, "pv");
    }

    #[tokio::test]
    async fn test_double_registration_rejected() {
        let bus: EventBus<Reading> = EventBus::new("test");
        let rec = Recorder::<Reading>::new();
        let as_dyn: Arc<dyn Listener<Reading>> = rec.clone();
        bus.register(as_dyn.clone(), None).unwrap();
        assert_eq!(bus.register(rec.clone(), None), Err(EventError::AlreadyRegistered));
        assert_eq!(bus.listener_count(), 1);

        assert!(bus.deregister(&as_dyn));
        assert!(bus.register(as_dyn, None).is_ok());
    }

    #[tokio::test]
    async fn test_deregister_stops_delivery() {
        let bus: EventBus<Reading> = EventBus::new("test");
        let rec = Recorder::<Reading>::new();
        let as_dyn: Arc<dyn Listener<Reading>> = rec.clone();
        bus.register(as_dyn.clone(), None).unwrap();

        bus.trigger(reading("grid", 1));
        settle().await;
        assert!(bus.deregister(&as_dyn));
        assert!(!bus.deregister(&as_dyn));

        assert_eq!(bus.trigger(reading("grid", 2)), 0);
        settle().await;
        assert_eq!(rec.count().await, 1);
    }

    #[tokio::test]
    async fn test_each_listener_gets_one_copy() {
        let bus: EventBus<Reading> = EventBus::new("test");
        let a = Recorder::<Reading>::new();
        let b = Recorder::<Reading>::new();
        bus.register(a.clone(), None).unwrap();
        bus.register(b.clone(), None).unwrap();

        assert_eq!(bus.trigger(reading("grid", 5)), 2);
        settle().await;
        assert_eq!(a.count().await, 1);
        assert_eq!(b.count().await, 1);
    }
}
