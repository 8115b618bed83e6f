use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use flowtrack_config::{FlowtrackConfig, ProtoTimeoutSettings};
use flowtrack_core::prelude::*;
use flowtrack_telemetry::{EventLogger, MetricsRecorder};

use crate::simulate::{self, SimulationPlan};

#[derive(Parser)]
#[command(name = "flowtrack", version, about)]
pub struct Cli {
    /// Load this YAML file instead of the `config/` directory
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run synthetic traffic through the flow engine with a live flow manager
    Simulate(SimulateArgs),
    /// Validate the configuration and print the resolved values
    CheckConfig,
}

#[derive(Args, Debug, Clone)]
pub struct SimulateArgs {
    /// Worker threads generating packets (defaults to the CPU count)
    #[arg(short, long)]
    pub workers: Option<usize>,
    /// Packets per worker
    #[arg(long, default_value_t = 100_000)]
    pub packets: u64,
    /// Distinct flow identities to draw from
    #[arg(long, default_value_t = 50_000)]
    pub flows: u32,
    /// Virtual time between two packets, in microseconds
    #[arg(long, default_value_t = 100)]
    pub packet_gap_us: u64,
    /// Probability that a packet closes its flow
    #[arg(long, default_value_t = 0.05)]
    pub close_rate: f64,
    #[arg(long, default_value_t = 0)]
    pub seed: u64,
}

/// Engine configuration from the loaded settings.
pub fn flow_config(config: &FlowtrackConfig) -> FlowConfig {
    let t = &config.timeouts;
    let mut timeouts = TimeoutPolicy::new();
    for (kind, settings) in [
        (FlowProtoKind::Default, &t.default),
        (FlowProtoKind::Tcp, &t.tcp),
        (FlowProtoKind::Udp, &t.udp),
        (FlowProtoKind::Icmp, &t.icmp),
        (FlowProtoKind::Sctp, &t.sctp),
    ] {
        timeouts.set(kind, proto_timeouts(settings));
    }

    FlowConfig {
        hash_size: config.flow.hash_size,
        hash_seed: config.flow.hash_seed,
        memcap: config.flow.memcap,
        prealloc: config.flow.prealloc,
        timeouts,
        emergency: EmergencyThresholds {
            high_water_pct: config.manager.emergency_high_water,
            low_water_pct: config.manager.emergency_low_water,
            recovery_pct: config.manager.emergency_recovery,
        },
        scan_interval: Duration::from_millis(config.manager.scan_interval_ms),
        emergency_scan_interval: Duration::from_millis(config.manager.emergency_scan_interval_ms),
    }
}

fn proto_timeouts(s: &ProtoTimeoutSettings) -> ProtoTimeouts {
    ProtoTimeouts::from_secs(
        [s.new, s.established, s.closed],
        [s.emergency_new, s.emergency_established, s.emergency_closed],
    )
}

pub async fn run_simulation(args: SimulateArgs, config: &FlowtrackConfig) -> anyhow::Result<()> {
    let metrics =
        MetricsRecorder::new().map_err(|e| anyhow::anyhow!("Failed to register metrics: {e}"))?;
    let plan = SimulationPlan {
        workers: args.workers.unwrap_or_else(num_cpus::get).max(1),
        packets_per_worker: args.packets,
        flows: args.flows.max(1),
        packet_gap: Duration::from_micros(args.packet_gap_us),
        close_rate: args.close_rate.clamp(0.0, 1.0),
        seed: args.seed,
    };

    let summary = simulate::run(plan, flow_config(config), &metrics).await?;

    println!("packets:   {}", summary.packets);
    println!("tracked:   {}", summary.tracked);
    println!("untracked: {}", summary.untracked);
    println!("elapsed:   {:?}", summary.elapsed);
    println!("{:#?}", summary.stats);
    EventLogger::log_stats(&summary.stats);
    let exposition = metrics
        .gather_metrics()
        .map_err(|e| anyhow::anyhow!("Failed to gather metrics: {e}"))?;
    print!("{exposition}");
    Ok(())
}

pub fn check_config(config: &FlowtrackConfig) -> anyhow::Result<()> {
    let flow = flow_config(config);
    flow.validate(FLOW_SIZE)
        .context("Configuration is invalid for the flow engine")?;

    print!("{}", serde_yaml::to_string(config)?);
    println!(
        "# flow object size {} bytes, up to {} flows within memcap",
        FLOW_SIZE,
        flow.memcap / FLOW_SIZE
    );
    Ok(())
}
