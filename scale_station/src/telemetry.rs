use opentelemetry::{
    global,
    metrics::{Counter, Gauge, Histogram, MeterProvider},
    KeyValue,
};
use prometheus::Registry;

pub struct Metrics {
    tick_counter: Counter<u64>,
    tick_duration: Histogram<u64>,
    lock_counter: Counter<u64>,
    scale_weight: Gauge<f64>,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        // TODO: deprecated crate to be replaced with an OLTP exporter
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()
            .unwrap();

        let provider = opentelemetry_sdk::metrics::SdkMeterProvider::builder()
            .with_reader(exporter)
            .build();

        let meter = provider.meter("scale_station");
        global::set_meter_provider(provider);

        let tick_counter = meter
            .u64_counter("pipeline_ticks_total")
            .with_description("Total number of pipeline ticks")
            .build();

        let tick_duration = meter
            .u64_histogram("tick_duration_ms")
            .with_boundaries(vec![
                5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0,
            ])
            .with_description("Duration of one pipeline tick in milliseconds")
            .build();

        let lock_counter = meter
            .u64_counter("lock_episodes_total")
            .with_description("Number of detection lock episodes")
            .build();

        let scale_weight = meter
            .f64_gauge("scale_weight_grams")
            .with_description("Last weight reading from the scale")
            .build();

        Metrics {
            tick_counter,
            tick_duration,
            lock_counter,
            scale_weight,
            registry,
        }
    }

    pub fn record_tick(&self, phase: &'static str, duration_ms: u64) {
        let attributes = vec![KeyValue::new("phase", phase)];
        self.tick_counter.add(1, &attributes);
        self.tick_duration.record(duration_ms, &attributes);
    }

    pub fn record_lock(&self) {
        self.lock_counter.add(1, &[]);
    }

    pub fn record_weight(&self, grams: f64) {
        self.scale_weight.record(grams, &[]);
    }
}
