use lazy_static::lazy_static;
use prometheus::IntCounterVec;
use prometheus::IntGauge;
use prometheus::Opts;
use prometheus::Registry;


lazy_static! {
    pub static ref ACTIVE_WATCH_STREAMS: IntGauge = IntGauge::new(
        "active_watch_streams",
        "Number of running list/watch loops"
    )
    .expect("metric can not be created");

    pub static ref LIVE_HANDLER_REGISTRATIONS: IntGauge = IntGauge::new(
        "live_handler_registrations",
        "Number of handler registrations handed out by multiplexers"
    )
    .expect("metric can not be created");

    pub static ref WATCH_RESTARTS: IntCounterVec = IntCounterVec::new(
        Opts::new("watch_restarts", "List/watch loop restarts by reason"),
        &["reason"]
    )
    .expect("metric can not be created");

    pub static ref DELIVERED_EVENTS: IntCounterVec = IntCounterVec::new(
        Opts::new("delivered_events", "Handler callbacks invoked by event type"),
        &["event_type"]
    )
    .expect("metric can not be created");

    /// Crate registry, every collector below is registered on first access
    pub static ref REGISTRY: Registry = {
        let registry =
            Registry::new_custom(Some("dwatch".to_string()), None).expect("registry can be created");
        register_custom_metrics(&registry).expect("collector can be registered");
        registry
    };
}

/// Registers every collector of this crate on `registry`.
///
/// Fails with `AlreadyReg` when `registry` already holds them, e.g. for
/// [`REGISTRY`], which registers itself.
pub fn register_custom_metrics(registry: &Registry) -> prometheus::Result<()> {
    registry.register(Box::new(ACTIVE_WATCH_STREAMS.clone()))?;
    registry.register(Box::new(LIVE_HANDLER_REGISTRATIONS.clone()))?;
    registry.register(Box::new(WATCH_RESTARTS.clone()))?;
    registry.register(Box::new(DELIVERED_EVENTS.clone()))?;
    Ok(())
}

/// Text exposition of [`REGISTRY`].
pub fn gather_metrics() -> String {
    use prometheus::Encoder;

    let mut buffer = Vec::new();
    let encoder = prometheus::TextEncoder::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        tracing::error!("failed to encode metrics: {:?}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
