use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder,
};

pub struct Metrics {
    registry: Registry,
    pub events_published: IntCounter,
    pub events_unroutable: IntCounter,
    pub publish_failures: IntCounter,
    pub confirm_latency: Histogram,
    pub deliveries_received: IntCounter,
    pub deliveries_acked: IntCounter,
    pub handler_failures: IntCounter,
    pub open_channels: IntGauge,
}

impl Metrics {
    /// Collectors live in a registry owned by this instance, so several
    /// instances can coexist in one process.
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let events_published = IntCounter::new(
            "device_events_published_total",
            "Events confirmed by the broker",
        )?;
        let events_unroutable = IntCounter::new(
            "device_events_unroutable_total",
            "Events returned because no queue was bound for their routing key",
        )?;
        let publish_failures = IntCounter::new(
            "device_publish_failures_total",
            "Publishes that were nacked, timed out or lost their connection",
        )?;
        let confirm_latency = Histogram::with_opts(HistogramOpts::new(
            "device_publish_confirm_seconds",
            "Time from publish to broker confirm in seconds",
        ))?;
        let deliveries_received = IntCounter::new(
            "device_deliveries_received_total",
            "Deliveries handed to the consumer",
        )?;
        let deliveries_acked = IntCounter::new(
            "device_deliveries_acked_total",
            "Deliveries acknowledged after handling",
        )?;
        let handler_failures = IntCounter::new(
            "device_handler_failures_total",
            "Deliveries left unacknowledged because the handler failed",
        )?;
        let open_channels = IntGauge::new(
            "device_broker_open_channels",
            "Channels currently open on the broker connection",
        )?;

        registry.register(Box::new(events_published.clone()))?;
        registry.register(Box::new(events_unroutable.clone()))?;
        registry.register(Box::new(publish_failures.clone()))?;
        registry.register(Box::new(confirm_latency.clone()))?;
        registry.register(Box::new(deliveries_received.clone()))?;
        registry.register(Box::new(deliveries_acked.clone()))?;
        registry.register(Box::new(handler_failures.clone()))?;
        registry.register(Box::new(open_channels.clone()))?;

        Ok(Self {
            registry,
            events_published,
            events_unroutable,
            publish_failures,
            confirm_latency,
            deliveries_received,
            deliveries_acked,
            handler_failures,
            open_channels,
        })
    }

    /// Prometheus text exposition format.
    pub fn render(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
