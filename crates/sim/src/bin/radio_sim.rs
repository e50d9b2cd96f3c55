//! in-process radio link simulation across channel presets

use anyhow::{bail, Result};
use clap::Parser;
use colored::Colorize;
use crlink_radio::ShutdownReason;
use crlink_sim::{scenarios, ChannelPresets};

#[derive(Parser, Debug)]
#[command(version, about = "Run a crlink master/slave pair over simulated channels")]
struct Cli {
    /// Data packets the master sends per scenario
    #[arg(short = 'n', long, default_value_t = 50)]
    packets: u64,

    /// Transmissions per packet before the link is declared failed (0 = unbounded)
    #[arg(long, default_value_t = 32)]
    max_attempts: u32,

    /// Run only this preset (ideal, good, average, poor, extreme)
    #[arg(long)]
    preset: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    println!("{}", "crlink Radio Link Simulation".bright_blue().bold());
    println!("{}", "============================".bright_blue());

    let names: Vec<&str> = match cli.preset.as_deref() {
        Some(name) => vec![name],
        None => vec!["good", "average", "poor", "extreme"],
    };
    let max_attempts = (cli.max_attempts > 0).then_some(cli.max_attempts);

    for name in names {
        let Some(channel) = ChannelPresets::by_name(name) else {
            bail!("unknown preset '{name}'");
        };

        let header = format!("\n>>> {name} conditions");
        if name == "extreme" {
            println!("{}", header.bright_red().bold());
        } else {
            println!("{}", header.bright_green().bold());
        }
        println!("Bandwidth: {} bps", channel.bandwidth_bps);
        println!("Frame loss: {}%", (channel.loss * 100.0) as u32);
        println!("Latency: {:?} (jitter {:?})", channel.latency, channel.latency_jitter);

        let retry = scenarios::retry_for(&channel, max_attempts);
        println!("Ack timeout: {:?}", retry.ack_timeout);

        let report = scenarios::run_pair(channel, cli.packets, retry).await?;
        let master = &report.master.stats;

        let outcome = format!("{}", report.master.reason);
        match report.master.reason {
            ShutdownReason::Completed { .. } => println!("{}", outcome.bright_yellow()),
            _ => println!("{}", outcome.red()),
        }
        println!(
            "  acked {} / sent {} ({} retransmissions, {} timeouts, {} bad acks)",
            master.packets_acked,
            master.data_sent,
            master.retransmissions,
            master.ack_timeouts,
            master.ack_mismatches
        );
        println!(
            "  slave: {} acks sent, {} duplicates, {}/{} valid frames",
            report.slave.stats.acks_sent,
            report.slave.stats.duplicates,
            report.slave.stats.frames_valid,
            report.slave.stats.frames_received
        );
        println!(
            "  channel: {} dropped, {} corrupted",
            report.uplink.frames_dropped + report.downlink.frames_dropped,
            report.uplink.frames_corrupted + report.downlink.frames_corrupted
        );
        println!(
            "  {:.0} bps goodput, {:.0}% efficiency, {:?}",
            report.goodput_bps(),
            report.efficiency() * 100.0,
            report.elapsed
        );
        println!("{}", "-".repeat(50));
    }

    println!("\n{}", "All simulations complete!".bright_green().bold());
    Ok(())
}
