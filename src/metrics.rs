use crate::collectors::guests::CycleOutcome;
use crate::proxmox::{ErrorCategory, GuestKind};
use crate::state::State;
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, GaugeVec, Registry, TextEncoder};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

const GUEST_LABELS: [&str; 4] = ["vmid", "name", "node", "kind"];

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub pvewatch_up: Gauge,
    pub pvewatch_nodes_total: Gauge,
    pub pvewatch_guests_total: GaugeVec,
    pub pvewatch_guests_running: GaugeVec,
    pub pvewatch_guest_running: GaugeVec,
    pub pvewatch_guest_uptime_seconds: GaugeVec,
    pub pvewatch_guest_cpu_ratio: GaugeVec,
    pub pvewatch_guest_cpus: GaugeVec,
    pub pvewatch_guest_memory_used_bytes: GaugeVec,
    pub pvewatch_guest_memory_max_bytes: GaugeVec,
    pub pvewatch_guest_net_in_bytes: GaugeVec,
    pub pvewatch_guest_net_out_bytes: GaugeVec,
    pub pvewatch_guest_disk_max_bytes: GaugeVec,
    pub pvewatch_poll_cycles_total: Counter,
    pub pvewatch_poll_errors_total: CounterVec,
    pub pvewatch_last_poll_timestamp_seconds: Gauge,
    pub pvewatch_last_success_timestamp_seconds: Gauge,
    pub pvewatch_uptime_seconds: Gauge,
    pub pvewatch_scrape_count_total: Counter,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let pvewatch_up = Gauge::with_opts(opts!(
            "pvewatch_up",
            "1 if the last poll cycle against the Proxmox API succeeded"
        ))?;
        let pvewatch_nodes_total = Gauge::with_opts(opts!(
            "pvewatch_nodes_total",
            "Nodes seen in the last successful poll cycle"
        ))?;
        let pvewatch_guests_total = GaugeVec::new(
            opts!("pvewatch_guests_total", "Guests by kind (qemu, lxc)"),
            &["kind"],
        )?;
        let pvewatch_guests_running = GaugeVec::new(
            opts!("pvewatch_guests_running", "Running guests by kind"),
            &["kind"],
        )?;
        let pvewatch_guest_running = GaugeVec::new(
            opts!("pvewatch_guest_running", "1 if the guest status is running"),
            &GUEST_LABELS,
        )?;
        let pvewatch_guest_uptime_seconds = GaugeVec::new(
            opts!("pvewatch_guest_uptime_seconds", "Guest uptime in seconds"),
            &GUEST_LABELS,
        )?;
        let pvewatch_guest_cpu_ratio = GaugeVec::new(
            opts!(
                "pvewatch_guest_cpu_ratio",
                "Guest CPU usage as a fraction of its allotted CPUs (0..1)"
            ),
            &GUEST_LABELS,
        )?;
        let pvewatch_guest_cpus = GaugeVec::new(
            opts!("pvewatch_guest_cpus", "CPUs allotted to the guest"),
            &GUEST_LABELS,
        )?;
        let pvewatch_guest_memory_used_bytes = GaugeVec::new(
            opts!("pvewatch_guest_memory_used_bytes", "Guest memory used in bytes"),
            &GUEST_LABELS,
        )?;
        let pvewatch_guest_memory_max_bytes = GaugeVec::new(
            opts!("pvewatch_guest_memory_max_bytes", "Guest memory limit in bytes"),
            &GUEST_LABELS,
        )?;
        let pvewatch_guest_net_in_bytes = GaugeVec::new(
            opts!("pvewatch_guest_net_in_bytes", "Guest network bytes received"),
            &GUEST_LABELS,
        )?;
        let pvewatch_guest_net_out_bytes = GaugeVec::new(
            opts!("pvewatch_guest_net_out_bytes", "Guest network bytes sent"),
            &GUEST_LABELS,
        )?;
        let pvewatch_guest_disk_max_bytes = GaugeVec::new(
            opts!("pvewatch_guest_disk_max_bytes", "Guest root disk size in bytes"),
            &GUEST_LABELS,
        )?;
        let pvewatch_poll_cycles_total = Counter::with_opts(opts!(
            "pvewatch_poll_cycles_total",
            "Poll cycles run since start"
        ))?;
        let pvewatch_poll_errors_total = CounterVec::new(
            opts!(
                "pvewatch_poll_errors_total",
                "Failed poll cycles by error category"
            ),
            &["kind"],
        )?;
        let pvewatch_last_poll_timestamp_seconds = Gauge::with_opts(opts!(
            "pvewatch_last_poll_timestamp_seconds",
            "Unix time of the last poll cycle"
        ))?;
        let pvewatch_last_success_timestamp_seconds = Gauge::with_opts(opts!(
            "pvewatch_last_success_timestamp_seconds",
            "Unix time of the last successful poll cycle"
        ))?;
        let pvewatch_uptime_seconds = Gauge::with_opts(opts!(
            "pvewatch_uptime_seconds",
            "Seconds since pvewatch started"
        ))?;
        let pvewatch_scrape_count_total = Counter::with_opts(opts!(
            "pvewatch_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;

        register(&registry, &pvewatch_up)?;
        register(&registry, &pvewatch_nodes_total)?;
        register(&registry, &pvewatch_guests_total)?;
        register(&registry, &pvewatch_guests_running)?;
        register(&registry, &pvewatch_guest_running)?;
        register(&registry, &pvewatch_guest_uptime_seconds)?;
        register(&registry, &pvewatch_guest_cpu_ratio)?;
        register(&registry, &pvewatch_guest_cpus)?;
        register(&registry, &pvewatch_guest_memory_used_bytes)?;
        register(&registry, &pvewatch_guest_memory_max_bytes)?;
        register(&registry, &pvewatch_guest_net_in_bytes)?;
        register(&registry, &pvewatch_guest_net_out_bytes)?;
        register(&registry, &pvewatch_guest_disk_max_bytes)?;
        register(&registry, &pvewatch_poll_cycles_total)?;
        register(&registry, &pvewatch_poll_errors_total)?;
        register(&registry, &pvewatch_last_poll_timestamp_seconds)?;
        register(&registry, &pvewatch_last_success_timestamp_seconds)?;
        register(&registry, &pvewatch_uptime_seconds)?;
        register(&registry, &pvewatch_scrape_count_total)?;

        // error series start at zero
        for category in ErrorCategory::ALL {
            pvewatch_poll_errors_total.with_label_values(&[category.as_str()]);
        }

        Ok(Arc::new(Self {
            registry,
            pvewatch_up,
            pvewatch_nodes_total,
            pvewatch_guests_total,
            pvewatch_guests_running,
            pvewatch_guest_running,
            pvewatch_guest_uptime_seconds,
            pvewatch_guest_cpu_ratio,
            pvewatch_guest_cpus,
            pvewatch_guest_memory_used_bytes,
            pvewatch_guest_memory_max_bytes,
            pvewatch_guest_net_in_bytes,
            pvewatch_guest_net_out_bytes,
            pvewatch_guest_disk_max_bytes,
            pvewatch_poll_cycles_total,
            pvewatch_poll_errors_total,
            pvewatch_last_poll_timestamp_seconds,
            pvewatch_last_success_timestamp_seconds,
            pvewatch_uptime_seconds,
            pvewatch_scrape_count_total,
        }))
    }

    pub fn record_cycle(&self, outcome: CycleOutcome) {
        self.pvewatch_poll_cycles_total.inc();
        if let CycleOutcome::Failed(category) = outcome {
            self.pvewatch_poll_errors_total
                .with_label_values(&[category.as_str()])
                .inc();
        }
    }

    pub fn update_from_state(&self, state: &State) {
        self.pvewatch_up
            .set(if state.last_cycle_ok() { 1.0 } else { 0.0 });
        self.pvewatch_last_poll_timestamp_seconds
            .set(state.last_collect_timestamp_seconds as f64);
        if let Some(ts) = state.last_success_unix {
            self.pvewatch_last_success_timestamp_seconds.set(ts as f64);
        }
        self.pvewatch_nodes_total.set(state.nodes.len() as f64);

        for kind in GuestKind::ALL {
            let total = state.guest_count(kind);
            let running = state
                .guests
                .iter()
                .filter(|g| g.kind == kind && g.is_running())
                .count();
            self.pvewatch_guests_total
                .with_label_values(&[kind.as_str()])
                .set(total as f64);
            self.pvewatch_guests_running
                .with_label_values(&[kind.as_str()])
                .set(running as f64);
        }

        self.pvewatch_guest_running.reset();
        self.pvewatch_guest_uptime_seconds.reset();
        self.pvewatch_guest_cpu_ratio.reset();
        self.pvewatch_guest_cpus.reset();
        self.pvewatch_guest_memory_used_bytes.reset();
        self.pvewatch_guest_memory_max_bytes.reset();
        self.pvewatch_guest_net_in_bytes.reset();
        self.pvewatch_guest_net_out_bytes.reset();
        self.pvewatch_guest_disk_max_bytes.reset();

        for g in &state.guests {
            let vmid = g.vmid.to_string();
            let labels: [&str; 4] = [&vmid, &g.name, &g.node, g.kind.as_str()];
            self.pvewatch_guest_running
                .with_label_values(&labels)
                .set(if g.is_running() { 1.0 } else { 0.0 });
            self.pvewatch_guest_uptime_seconds
                .with_label_values(&labels)
                .set(g.uptime_seconds as f64);
            self.pvewatch_guest_cpu_ratio
                .with_label_values(&labels)
                .set(g.cpu_fraction);
            self.pvewatch_guest_cpus
                .with_label_values(&labels)
                .set(g.cpus);
            self.pvewatch_guest_memory_used_bytes
                .with_label_values(&labels)
                .set(g.memory_used_bytes as f64);
            self.pvewatch_guest_memory_max_bytes
                .with_label_values(&labels)
                .set(g.memory_max_bytes as f64);
            self.pvewatch_guest_net_in_bytes
                .with_label_values(&labels)
                .set(g.net_in_bytes as f64);
            self.pvewatch_guest_net_out_bytes
                .with_label_values(&labels)
                .set(g.net_out_bytes as f64);
            self.pvewatch_guest_disk_max_bytes
                .with_label_values(&labels)
                .set(g.disk_max_bytes as f64);
        }

        let uptime = now_unix().saturating_sub(state.started_at_unix) as f64;
        self.pvewatch_uptime_seconds.set(uptime);
    }

    pub fn inc_scrape_count(&self) {
        self.pvewatch_scrape_count_total.inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
