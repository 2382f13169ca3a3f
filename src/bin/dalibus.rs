use std::sync::Arc;
use std::time::Duration;

use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use dalibus::frame::opcode;
use dalibus::sim::{ControlGear, LineFaultConfig, SimulatedLine};
use dalibus::{
    command_queue, encode, AddressType, CommandOutcome, CommandProcessor, Config, DaliBus,
    DriverStatus, Frame, Level, LevelReading, ProcessorConfig, Transceiver,
};
use tokio::sync::broadcast;

const DEFAULT_RX_PIN: &str = "4";
const DEFAULT_TX_PIN: &str = "5";
const DEFAULT_TIMEOUT_MS: &str = "500";
const DEFAULT_GEAR_COUNT: &str = "4";

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() -> CliResult<()> {
    let matches = App::new("dalibus")
        .version("0.1.0")
        .author("Lighting Systems Engineering Team")
        .about("💡 DALI bus driver - drive a simulated DALI line from the command line")
        .setting(AppSettings::VersionlessSubcommands)
        .arg(
            Arg::with_name("rx-pin")
                .long("rx-pin")
                .value_name("PIN")
                .help("Receive pin")
                .takes_value(true)
                .default_value(DEFAULT_RX_PIN)
                .validator(is_byte)
                .global(true),
        )
        .arg(
            Arg::with_name("tx-pin")
                .long("tx-pin")
                .value_name("PIN")
                .help("Transmit pin")
                .takes_value(true)
                .default_value(DEFAULT_TX_PIN)
                .validator(is_byte)
                .global(true),
        )
        .arg(
            Arg::with_name("timeout")
                .short("t")
                .long("timeout")
                .value_name("MS")
                .help("Bus timeout in milliseconds")
                .takes_value(true)
                .default_value(DEFAULT_TIMEOUT_MS)
                .validator(|v| match v.parse::<u64>() {
                    Ok(ms) if ms > 0 => Ok(()),
                    _ => Err("Timeout must be a positive number of milliseconds".into()),
                })
                .global(true),
        )
        .arg(
            Arg::with_name("gear")
                .short("g")
                .long("gear")
                .value_name("COUNT")
                .help("Simulated control gear on the line, short addresses 0..COUNT")
                .takes_value(true)
                .default_value(DEFAULT_GEAR_COUNT)
                .validator(|v| match v.parse::<u8>() {
                    Ok(n) if n <= 64 => Ok(()),
                    _ => Err("Gear count must be between 0 and 64".into()),
                })
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["table", "json"])
                .default_value("table")
                .global(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Log driver activity")
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("encode")
                .about("〰️  Print the Manchester waveform of a forward frame")
                .arg(address_type_arg())
                .arg(address_arg())
                .arg(
                    Arg::with_name("command")
                        .help("Command opcode (decimal or 0x hex)")
                        .required(true)
                        .validator(is_byte),
                )
                .arg(
                    Arg::with_name("dapc")
                        .long("dapc")
                        .help("Treat the value as a direct arc power level"),
                ),
        )
        .subcommand(
            SubCommand::with_name("send")
                .about("📤 Send a command frame")
                .arg(address_type_arg())
                .arg(address_arg())
                .arg(
                    Arg::with_name("command")
                        .help("Command opcode (decimal or 0x hex)")
                        .required(true)
                        .validator(is_byte),
                )
                .arg(
                    Arg::with_name("repeat")
                        .short("r")
                        .long("repeat")
                        .help("Send the frame twice within the configuration window"),
                ),
        )
        .subcommand(
            SubCommand::with_name("query")
                .about("❓ Send a query and print the reply")
                .arg(address_type_arg())
                .arg(address_arg())
                .arg(
                    Arg::with_name("command")
                        .help("Query opcode (decimal or 0x hex)")
                        .required(true)
                        .validator(is_byte),
                ),
        )
        .subcommand(
            SubCommand::with_name("level")
                .about("🔆 Set or read the arc power level")
                .arg(address_type_arg())
                .arg(address_arg())
                .arg(
                    Arg::with_name("level")
                        .help("Level 0-254; omit to query the actual level")
                        .validator(|v| match parse_byte(&v) {
                            Some(level) if level <= 254 => Ok(()),
                            _ => Err("Level must be between 0 and 254".into()),
                        }),
                ),
        )
        .subcommand(
            SubCommand::with_name("group")
                .about("👥 Add a gear to a group or remove it")
                .arg(
                    Arg::with_name("short")
                        .help("Short address 0-63")
                        .required(true)
                        .validator(is_byte),
                )
                .arg(
                    Arg::with_name("group")
                        .help("Group 0-15")
                        .required(true)
                        .validator(is_byte),
                )
                .arg(
                    Arg::with_name("remove")
                        .long("remove")
                        .help("Remove instead of add"),
                ),
        )
        .subcommand(
            SubCommand::with_name("demo")
                .about("🎬 Run the command processor against a scripted set of requests")
                .arg(
                    Arg::with_name("base-topic")
                        .long("base-topic")
                        .value_name("TOPIC")
                        .takes_value(true)
                        .default_value("dali")
                        .help("Topic prefix for requests"),
                )
                .arg(
                    Arg::with_name("poll")
                        .long("poll")
                        .value_name("MS")
                        .takes_value(true)
                        .help("Poll gear levels at this interval")
                        .validator(|v| match v.parse::<u64>() {
                            Ok(ms) if ms > 0 => Ok(()),
                            _ => Err("Poll interval must be a positive number".into()),
                        }),
                )
                .arg(
                    Arg::with_name("faults")
                        .long("faults")
                        .help("Inject line faults at elevated rates"),
                ),
        )
        .get_matches();

    let verbose = matches.is_present("verbose");
    tracing_subscriber::fmt()
        .with_max_level(if verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::WARN
        })
        .init();

    let format = matches.value_of("format").unwrap_or("table");

    match matches.subcommand() {
        ("encode", Some(sub)) => handle_encode(sub, format)?,
        ("send", Some(sub)) => {
            let (line, bus) = open_bus(&matches)?;
            tokio::task::block_in_place(|| handle_send(sub, &bus, format))?;
            print_gear(&line, format, verbose);
        }
        ("query", Some(sub)) => {
            let (_line, bus) = open_bus(&matches)?;
            tokio::task::block_in_place(|| handle_query(sub, &bus, format))?;
        }
        ("level", Some(sub)) => {
            let (line, bus) = open_bus(&matches)?;
            tokio::task::block_in_place(|| handle_level(sub, &bus, format))?;
            print_gear(&line, format, verbose);
        }
        ("group", Some(sub)) => {
            let (line, bus) = open_bus(&matches)?;
            tokio::task::block_in_place(|| handle_group(sub, &bus, format))?;
            print_gear(&line, format, verbose);
        }
        ("demo", Some(sub)) => handle_demo(sub, &matches, format).await?,
        _ => {
            println!("{}", "No command specified. Use --help for usage information.".yellow());
            println!("{}", "Quick start:".bright_green());
            println!("  {} Run the processor demo", "dalibus demo".bright_cyan());
            println!("  {} Dim short address 1", "dalibus level short 1 120".bright_cyan());
            println!("  {} Read its level back", "dalibus level short 1".bright_cyan());
        }
    }

    Ok(())
}

fn address_type_arg() -> Arg<'static, 'static> {
    Arg::with_name("address-type")
        .help("Addressing mode")
        .required(true)
        .possible_values(&["short", "group", "broadcast", "special"])
}

fn address_arg() -> Arg<'static, 'static> {
    Arg::with_name("address")
        .help("Short address, group number or special data byte")
        .required(true)
        .validator(is_byte)
}

fn parse_byte(value: &str) -> Option<u8> {
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

fn is_byte(value: String) -> Result<(), String> {
    parse_byte(&value)
        .map(|_| ())
        .ok_or_else(|| format!("'{}' is not a byte value", value))
}

fn byte_arg(matches: &ArgMatches<'_>, name: &str) -> CliResult<u8> {
    matches
        .value_of(name)
        .and_then(parse_byte)
        .ok_or_else(|| format!("missing or invalid <{}>", name).into())
}

fn address_type(matches: &ArgMatches<'_>) -> AddressType {
    match matches.value_of("address-type") {
        Some("group") => AddressType::Group,
        Some("broadcast") => AddressType::Broadcast,
        Some("special") => AddressType::Special,
        _ => AddressType::Short,
    }
}

/// Build the simulated line, claim it and wrap it in a bus.
fn open_bus(matches: &ArgMatches<'_>) -> CliResult<(SimulatedLine, Arc<DaliBus>)> {
    let gear_count = matches
        .value_of("gear")
        .and_then(|v| v.parse::<u8>().ok())
        .unwrap_or(0);
    let line = SimulatedLine::new();
    for short in 0..gear_count {
        // Even addresses start in group 0, odd ones in group 1
        line.add_gear(ControlGear::new(short).with_groups(1u16 << (short % 2)));
    }

    let timeout_ms = matches
        .value_of("timeout")
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(500);
    let config = Config::new(byte_arg(matches, "rx-pin")?, byte_arg(matches, "tx-pin")?)
        .with_bus_timeout_ms(timeout_ms);

    let transceiver = match Transceiver::init(config, line.phy()) {
        Ok(transceiver) => transceiver,
        Err(e) => {
            eprintln!("{} Failed to open DALI bus: {}", "❌".red(), e.to_string().bright_red());
            return Err(e.into());
        }
    };
    Ok((line, Arc::new(DaliBus::new(transceiver))))
}

fn handle_encode(matches: &ArgMatches<'_>, format: &str) -> CliResult<()> {
    let address_type = address_type(matches);
    let address = byte_arg(matches, "address")?;
    let value = byte_arg(matches, "command")?;

    let frame = if matches.is_present("dapc") {
        Frame::dapc(address_type, address, value)?
    } else {
        Frame::command(address_type, address, value)?
    };
    let pulses = encode(&frame);

    if format == "json" {
        let waveform: Vec<(bool, u32)> = pulses
            .iter()
            .map(|p| (p.level == Level::Active, p.duration_us))
            .collect();
        println!(
            "{}",
            serde_json::json!({ "frame": frame.to_string(), "pulses": waveform })
        );
        return Ok(());
    }

    println!("{} {}", "Frame".bright_white().bold(), frame.to_string().bright_cyan());
    let trace: String = pulses
        .iter()
        .map(|p| {
            let width = (p.duration_us / 208).max(1) as usize;
            let glyph = if p.level == Level::Active { "▁" } else { "▔" };
            glyph.repeat(width)
        })
        .collect();
    println!("{}", trace);
    for (index, pulse) in pulses.iter().enumerate() {
        let level = match pulse.level {
            Level::Active => "active".bright_yellow(),
            Level::Idle => "idle".dimmed(),
        };
        println!("  {:>2}  {:<7} {:>4} µs", index, level, pulse.duration_us);
    }
    Ok(())
}

fn handle_send(matches: &ArgMatches<'_>, bus: &DaliBus, format: &str) -> CliResult<()> {
    let address_type = address_type(matches);
    let address = byte_arg(matches, "address")?;
    let command = byte_arg(matches, "command")?;
    let repeat = matches.is_present("repeat") || opcode::is_config_command(command);

    let status = bus.send_command(address_type, address, command, repeat);
    print_status(&format!("command 0x{:02X}", command), status, None, format);
    Ok(())
}

fn handle_query(matches: &ArgMatches<'_>, bus: &DaliBus, format: &str) -> CliResult<()> {
    let frame = Frame::command(
        address_type(matches),
        byte_arg(matches, "address")?,
        byte_arg(matches, "command")?,
    )?;
    let result = bus.query(&frame);
    print_status(&format!("query {}", frame), result.status, result.backward_byte(), format);
    Ok(())
}

fn handle_level(matches: &ArgMatches<'_>, bus: &DaliBus, format: &str) -> CliResult<()> {
    let address_type = address_type(matches);
    let address = byte_arg(matches, "address")?;

    match matches.value_of("level").and_then(parse_byte) {
        Some(level) => {
            let status = bus.set_level(address_type, address, level);
            print_status(&format!("level {}", level), status, None, format);
        }
        None => {
            let reading = bus.query_level(address_type, address);
            if format == "json" {
                println!("{}", serde_json::to_string(&reading)?);
                return Ok(());
            }
            match reading {
                LevelReading::Level(level) => {
                    println!("{} Actual level {}", "✅".green(), level.to_string().bright_cyan())
                }
                LevelReading::Mask => println!("{} Level unknown (MASK)", "⚠️".yellow()),
                LevelReading::NoReply => {
                    println!("{} No reply", "⏰".yellow());
                    println!("{} Check the address or try a longer --timeout", "💡".yellow());
                }
            }
        }
    }
    Ok(())
}

fn handle_group(matches: &ArgMatches<'_>, bus: &DaliBus, format: &str) -> CliResult<()> {
    let short = byte_arg(matches, "short")?;
    let group = byte_arg(matches, "group")?;
    let add = !matches.is_present("remove");

    let status = bus.manage_group(short, group, add);
    let action = format!("{} group {}", if add { "add to" } else { "remove from" }, group);
    print_status(&action, status, None, format);
    Ok(())
}

/// Requests the demo feeds through the processor, relative to the base topic.
fn demo_script() -> Vec<(&'static str, &'static str)> {
    vec![
        ("light/0/set", r#"{"state":"ON","brightness":200}"#),
        ("light/1/set", r#"{"state":"ON"}"#),
        ("light/group/0/set", r#"{"brightness":80}"#),
        ("config/group/set", r#"{"short":1,"group":3,"state":"add"}"#),
        ("light/group/3/set", r#"{"brightness":42}"#),
        ("light/0/get", ""),
        ("light/1/get", ""),
        ("command", r#"{"address_type":"short","address":0,"command":144,"query":true}"#),
        ("light/99/set", r#"{"state":"ON"}"#),
        ("light/broadcast/set", r#"{"state":"OFF"}"#),
    ]
}

async fn handle_demo(sub: &ArgMatches<'_>, matches: &ArgMatches<'_>, format: &str) -> CliResult<()> {
    let (line, bus) = open_bus(matches)?;
    if sub.is_present("faults") {
        line.set_faults(LineFaultConfig {
            enabled: true,
            drop_reply_percent: 10.0,
            corrupt_timing_percent: 5.0,
            stuck_active_percent: 2.0,
            ..LineFaultConfig::default()
        });
    }

    let gear_mask = line
        .gear_snapshot()
        .iter()
        .filter_map(|g| g.short_address)
        .fold(0u64, |mask, short| mask | (1u64 << short));
    let config = ProcessorConfig {
        base_topic: sub.value_of("base-topic").unwrap_or("dali").to_string(),
        poll_interval_ms: sub.value_of("poll").and_then(|v| v.parse().ok()),
        poll_devices: gear_mask,
        ..ProcessorConfig::default()
    };
    config.validate()?;

    let (queue, receiver) = command_queue(config.queue_capacity);
    let processor = CommandProcessor::new(Arc::clone(&bus), config.clone(), receiver);
    let mut outcomes = processor.subscribe();
    let (shutdown, task) = processor.spawn();

    let script = demo_script();
    if format != "json" {
        println!("{}", "🎬 DALI command processor demo".bright_blue().bold());
        println!("{}", "══════════════════════════════".bright_blue());
    }

    let mut queued = 0;
    for (suffix, payload) in &script {
        let topic = format!("{}/{}", config.base_topic, suffix);
        match queue.submit(&topic, payload.as_bytes()) {
            Ok(()) => queued += 1,
            Err(status) => println!("{} {} not queued: {}", "⚠️".yellow(), topic, status),
        }
    }

    let mut answered = 0;
    while answered < queued {
        match tokio::time::timeout(Duration::from_secs(10), outcomes.recv()).await {
            Ok(Ok(outcome)) => {
                if outcome.action.is_some() || outcome.error.is_some() {
                    answered += 1;
                }
                print_outcome(&outcome, format)?;
            }
            Ok(Err(broadcast::error::RecvError::Lagged(missed))) => {
                println!("{} Missed {} outcomes", "⚠️".yellow(), missed);
            }
            Ok(Err(broadcast::error::RecvError::Closed)) => break,
            Err(_) => {
                eprintln!("{} Processor stopped answering", "⏰".yellow());
                break;
            }
        }
    }

    // Give the poller a chance to report when it is enabled
    if config.poll_interval_ms.is_some() {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while let Ok(Ok(outcome)) = tokio::time::timeout_at(deadline, outcomes.recv()).await {
            print_outcome(&outcome, format)?;
        }
    }

    shutdown.shutdown();
    let stats = task.await?;

    if format == "json" {
        println!("{}", serde_json::to_string(&stats)?);
    } else {
        println!("\n{}", "📊 Processor statistics".bright_white().bold());
        println!("Received: {}", stats.received.to_string().bright_cyan());
        println!("Executed: {}", stats.executed.to_string().bright_cyan());
        println!("Failed:   {}", stats.failed.to_string().bright_yellow());
        println!("Rejected: {}", stats.rejected.to_string().bright_yellow());
        if stats.polls > 0 {
            println!("Polls:    {} ({} state reports)", stats.polls, stats.state_reports);
        }
        let faults = line.fault_stats();
        if faults.transactions > 0 {
            println!(
                "Line faults: {} dropped, {} corrupted, {} stuck",
                faults.replies_dropped, faults.timings_corrupted, faults.stuck_events
            );
        }
    }
    print_gear(&line, format, true);
    Ok(())
}

fn status_label(status: DriverStatus) -> ColoredString {
    match status {
        DriverStatus::Ok => status.to_string().bright_green(),
        DriverStatus::BusBusy | DriverStatus::Timeout | DriverStatus::QueueFull => {
            status.to_string().bright_yellow()
        }
        DriverStatus::FrameError | DriverStatus::Collision => status.to_string().bright_red(),
    }
}

fn print_status(action: &str, status: DriverStatus, reply: Option<u8>, format: &str) {
    if format == "json" {
        println!(
            "{}",
            serde_json::json!({ "action": action, "status": status, "reply": reply })
        );
        return;
    }
    match (status, reply) {
        (DriverStatus::Ok, Some(reply)) => println!(
            "{} {} replied 0x{:02X} ({})",
            "✅".green(),
            action.bright_white(),
            reply,
            reply.to_string().bright_cyan()
        ),
        (DriverStatus::Ok, None) => println!("{} {} sent", "✅".green(), action.bright_white()),
        (DriverStatus::Timeout, _) => {
            println!("{} {} timed out", "⏰".yellow(), action.bright_white());
        }
        (status, _) => println!(
            "{} {} failed: {}",
            "❌".red(),
            action.bright_white(),
            status_label(status)
        ),
    }
}

fn print_outcome(outcome: &CommandOutcome, format: &str) -> CliResult<()> {
    if format == "json" {
        println!("{}", serde_json::to_string(outcome)?);
        return Ok(());
    }
    let mut line = format!("{:<28} {}", outcome.topic, status_label(outcome.status));
    if let Some(reply) = outcome.reply {
        line.push_str(&format!("  reply {}", reply.to_string().bright_cyan()));
    }
    if let Some(state) = &outcome.state {
        line.push_str(&format!("  state {}", serde_json::to_string(state)?.dimmed()));
    }
    if let Some(error) = &outcome.error {
        line.push_str(&format!("  {}", error.bright_red()));
    }
    println!("{}", line);
    Ok(())
}

fn print_gear(line: &SimulatedLine, format: &str, show: bool) {
    if !show || format == "json" {
        return;
    }
    println!("\n{}", "Simulated gear".bright_white().bold());
    println!("{}", "┌───────┬───────┬──────────────────┐".bright_white());
    println!("{}", "│ Short │ Level │ Groups           │".bright_white());
    println!("{}", "├───────┼───────┼──────────────────┤".bright_white());
    for gear in line.gear_snapshot() {
        let short = gear
            .short_address
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".into());
        println!(
            "│ {:>5} │ {:>5} │ {:016b} │",
            short, gear.actual_level, gear.groups
        );
    }
    println!("{}", "└───────┴───────┴──────────────────┘".bright_white());
}
