//! Prometheus text exposition of the collector state.

use std::fmt::Write;

use crate::store::StateSnapshot;
use crate::CollectorStats;

const WORKLOAD_ENERGY: [(&str, &str); 4] = [
    ("core", "CPU core energy attributed to the workload"),
    ("dram", "DRAM energy attributed to the workload"),
    ("other", "Energy not covered by core, dram and gpu sensors"),
    ("gpu", "GPU energy attributed to the workload"),
];

/// Escapes a label value.
fn escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

fn header(output: &mut String, name: &str, kind: &str, help: &str) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {kind}");
}

/// Renders workload counters, the last device sample and collector statistics.
pub fn render_metrics(snapshot: &StateSnapshot, stats: Option<&CollectorStats>) -> String {
    let mut output = String::new();

    let labels: Vec<String> = snapshot
        .workloads
        .iter()
        .map(|w| {
            format!(
                "workload=\"{}\",namespace=\"{}\"",
                escape(&w.identity.name),
                escape(&w.identity.namespace)
            )
        })
        .collect();

    for (domain, help) in WORKLOAD_ENERGY {
        let name = format!("podwatt_workload_{domain}_joules_total");
        header(&mut output, &name, "counter", help);
        for (workload, labels) in snapshot.workloads.iter().zip(&labels) {
            let mj = match domain {
                "core" => workload.aggregate.core_energy_mj,
                "dram" => workload.aggregate.dram_energy_mj,
                "other" => workload.aggregate.other_energy_mj,
                _ => workload.aggregate.gpu_energy_mj,
            };
            let _ = writeln!(output, "{name}{{{labels}}} {}", mj as f64 / 1000.0);
        }
    }

    header(
        &mut output,
        "podwatt_workload_cpu_time_total",
        "counter",
        "CPU time of the workload in collector units",
    );
    for (workload, labels) in snapshot.workloads.iter().zip(&labels) {
        let _ = writeln!(
            output,
            "podwatt_workload_cpu_time_total{{{labels}}} {}",
            workload.aggregate.cpu_time
        );
    }

    let counters: [(&str, &str, fn(&crate::store::UsageCounters) -> u64); 3] = [
        ("cpu_cycles", "CPU cycles of the workload", |c| c.cpu_cycles),
        ("cpu_instructions", "CPU instructions of the workload", |c| {
            c.cpu_instructions
        }),
        ("cache_misses", "Cache misses of the workload", |c| c.cache_misses),
    ];
    for (metric, help, value) in counters {
        let name = format!("podwatt_workload_{metric}_total");
        header(&mut output, &name, "counter", help);
        for (workload, labels) in snapshot.workloads.iter().zip(&labels) {
            let _ = writeln!(output, "{name}{{{labels}}} {}", value(&workload.aggregate));
        }
    }

    header(
        &mut output,
        "podwatt_workload_io_bytes",
        "gauge",
        "Last cumulative block I/O reading of the workload",
    );
    for (workload, labels) in snapshot.workloads.iter().zip(&labels) {
        let _ = writeln!(
            output,
            "podwatt_workload_io_bytes{{{labels},direction=\"read\"}} {}",
            workload.aggregate.bytes_read
        );
        let _ = writeln!(
            output,
            "podwatt_workload_io_bytes{{{labels},direction=\"write\"}} {}",
            workload.aggregate.bytes_written
        );
    }

    header(
        &mut output,
        "podwatt_device_energy_joules",
        "gauge",
        "Energy measured for the device during the last cycle",
    );
    let device = &snapshot.device;
    for (domain, mj) in [
        ("core", device.core_energy_mj),
        ("dram", device.dram_energy_mj),
        ("other", device.other_energy_mj),
        ("gpu", device.gpu_energy_mj),
    ] {
        let _ = writeln!(
            output,
            "podwatt_device_energy_joules{{domain=\"{domain}\"}} {}",
            mj / 1000.0
        );
    }
    header(
        &mut output,
        "podwatt_device_memory_bytes",
        "gauge",
        "Memory in use on the device",
    );
    let _ = writeln!(output, "podwatt_device_memory_bytes {}", device.device_memory);

    header(
        &mut output,
        "podwatt_collector_cycle",
        "counter",
        "Number of attributed cycles",
    );
    let _ = writeln!(output, "podwatt_collector_cycle {}", snapshot.cycle);

    if let Some(stats) = stats {
        header(
            &mut output,
            "podwatt_collector_cycles_total",
            "counter",
            "Collector cycles by outcome",
        );
        let _ = writeln!(
            output,
            "podwatt_collector_cycles_total{{outcome=\"attributed\"}} {}",
            stats.attributed_cycles()
        );
        for (reason, count) in stats.skip_reasons() {
            let _ = writeln!(
                output,
                "podwatt_collector_cycles_total{{outcome=\"skipped\",reason=\"{reason}\"}} {count}"
            );
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DeviceEnergySample, WorkloadEnergyRecord, WorkloadIdentity};

    fn snapshot() -> StateSnapshot {
        let mut record = WorkloadEnergyRecord {
            identity: WorkloadIdentity {
                name: "pod-1".to_string(),
                namespace: "unknown".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        record.aggregate.core_energy_mj = 1500;
        record.aggregate.cpu_cycles = 42;
        StateSnapshot {
            cycle: 3,
            last_cycle_at: None,
            device: DeviceEnergySample {
                core_energy_mj: 2000.0,
                ..Default::default()
            },
            workloads: vec![record],
        }
    }

    #[test]
    fn renders_workload_counters_in_joules() {
        let text = render_metrics(&snapshot(), None);
        assert!(text.contains("# TYPE podwatt_workload_core_joules_total counter"));
        assert!(text.contains(
            "podwatt_workload_core_joules_total{workload=\"pod-1\",namespace=\"unknown\"} 1.5"
        ));
        assert!(text.contains(
            "podwatt_workload_cpu_cycles_total{workload=\"pod-1\",namespace=\"unknown\"} 42"
        ));
        assert!(text.contains("podwatt_device_energy_joules{domain=\"core\"} 2"));
        assert!(text.contains("podwatt_collector_cycle 3"));
    }

    #[test]
    fn renders_skip_reasons() {
        let mut stats = CollectorStats::new();
        stats.record_skipped_cycle(crate::collector::SkipReason::StalledSensor);
        let text = render_metrics(&snapshot(), Some(&stats));
        assert!(text.contains(
            "podwatt_collector_cycles_total{outcome=\"skipped\",reason=\"stalled_sensor\"} 1"
        ));
    }

    #[test]
    fn label_values_are_escaped() {
        assert_eq!(escape("a\"b\\c"), "a\\\"b\\\\c");
    }
}
