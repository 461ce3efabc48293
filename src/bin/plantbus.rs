use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use plantbus::gateway::{DeviceView, SignalInfo, WriteOutcome};
use plantbus::hub::Notification;
use plantbus::protocol::{Request, RequestType, Response, ResponsePayload, ServerMessage};
use plantbus::{Sample, Value};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "4334";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() -> CliResult<()> {
    let signal_arg = || {
        Arg::with_name("signal")
            .help("Signal key, e.g. Device1_Temperature")
            .required(true)
    };

    let matches = App::new("plantbus")
        .version("0.1.0")
        .about("Client for the virtual plant data-access server")
        .setting(AppSettings::VersionlessSubcommands)
        .arg(
            Arg::with_name("host")
                .short("H")
                .long("host")
                .value_name("HOST")
                .help("Server host address")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Server port")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["json", "table", "compact"])
                .default_value("table")
                .global(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Enable verbose output")
                .global(true),
        )
        .subcommand(SubCommand::with_name("ping").about("Test connection to the server"))
        .subcommand(SubCommand::with_name("browse").about("List every registered signal"))
        .subcommand(
            SubCommand::with_name("read")
                .about("Read the latest value of a signal")
                .arg(signal_arg()),
        )
        .subcommand(
            SubCommand::with_name("write")
                .about("Write a value to a writable signal")
                .long_about("Values are sent loosely typed: ON/OFF, true/false and numbers are coerced by the server")
                .arg(signal_arg())
                .arg(Arg::with_name("value").help("Value to write").required(true)),
        )
        .subcommand(
            SubCommand::with_name("history")
                .about("Query the stored history of a signal, or of every signal when none is given")
                .arg(Arg::with_name("signal").help("Signal key, e.g. Device1_Temperature"))
                .arg(
                    Arg::with_name("start")
                        .long("start")
                        .value_name("MS")
                        .help("Inclusive start time (Unix milliseconds)")
                        .takes_value(true)
                        .validator(validate_u64),
                )
                .arg(
                    Arg::with_name("end")
                        .long("end")
                        .value_name("MS")
                        .help("Inclusive end time (Unix milliseconds)")
                        .takes_value(true)
                        .validator(validate_u64),
                )
                .arg(
                    Arg::with_name("last")
                        .short("n")
                        .long("last")
                        .value_name("COUNT")
                        .help("Only the most recent COUNT samples")
                        .takes_value(true)
                        .default_value("0")
                        .validator(validate_u64),
                ),
        )
        .subcommand(SubCommand::with_name("snapshot").about("Latest value of every signal"))
        .subcommand(SubCommand::with_name("devices").about("Dashboard view grouped by device"))
        .subcommand(
            SubCommand::with_name("subscribe")
                .about("Stream change notifications for a signal")
                .arg(signal_arg())
                .arg(
                    Arg::with_name("interval")
                        .short("i")
                        .long("interval")
                        .value_name("MS")
                        .help("Requested sampling interval")
                        .takes_value(true)
                        .default_value("100")
                        .validator(validate_u64),
                )
                .arg(
                    Arg::with_name("depth")
                        .short("d")
                        .long("depth")
                        .value_name("N")
                        .help("Queue depth")
                        .takes_value(true)
                        .default_value("10")
                        .validator(validate_u64),
                )
                .arg(
                    Arg::with_name("reject")
                        .long("reject")
                        .help("Reject new samples on overflow instead of discarding the oldest"),
                ),
        )
        .subcommand(SubCommand::with_name("monitor").about("Stream pub/sub bridge messages"))
        .subcommand(
            SubCommand::with_name("reset-history")
                .about("Clear the stored history of every signal")
                .arg(
                    Arg::with_name("confirm")
                        .long("confirm")
                        .help("Confirm the reset")
                        .required(true),
                ),
        )
        .get_matches();

    let host = matches.value_of("host").unwrap_or(DEFAULT_HOST);
    let port = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse::<u16>()?;
    let format = matches.value_of("format").unwrap_or("table");
    let verbose = matches.is_present("verbose");

    if verbose {
        println!("{}", "Plant Bus client".bright_blue().bold());
        println!("{} {}:{}", "Connecting to".dimmed(), host, port);
    }

    let client = Client { host, port, format };

    match matches.subcommand() {
        ("ping", _) => client.ping().await?,
        ("browse", _) => client.browse().await?,
        ("read", Some(sub)) => client.read(required(sub, "signal")?).await?,
        ("write", Some(sub)) => client.write(required(sub, "signal")?, required(sub, "value")?).await?,
        ("history", Some(sub)) => client.history(sub).await?,
        ("snapshot", _) => client.snapshot().await?,
        ("devices", _) => client.devices().await?,
        ("subscribe", Some(sub)) => client.subscribe(sub).await?,
        ("monitor", _) => client.monitor().await?,
        ("reset-history", _) => client.reset_history().await?,
        _ => {
            println!("{}", "No command specified. Use --help for usage information.".yellow());
            println!("{}", "Quick start:".bright_green());
            println!("  {} Start the server", "plantbus-server".bright_cyan());
            println!("  {} Test connection", "plantbus ping".bright_cyan());
            println!("  {} Show every device", "plantbus devices".bright_cyan());
        }
    }

    Ok(())
}

fn validate_u64(value: String) -> Result<(), String> {
    value
        .parse::<u64>()
        .map(|_| ())
        .map_err(|_| "Value must be a non-negative number".to_string())
}

fn required<'a>(matches: &'a ArgMatches<'_>, name: &str) -> CliResult<&'a str> {
    matches.value_of(name).ok_or_else(|| format!("Missing argument <{}>", name).into())
}

fn parse_opt_u64(matches: &ArgMatches<'_>, name: &str) -> CliResult<Option<u64>> {
    Ok(match matches.value_of(name) {
        Some(v) => Some(v.parse()?),
        None => None,
    })
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

struct Connection {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: tokio::net::tcp::OwnedWriteHalf,
    next_id: u32,
}

impl Connection {
    async fn open(host: &str, port: u16) -> CliResult<Self> {
        let addr = format!("{}:{}", host, port);
        let stream = match TcpStream::connect(&addr).await {
            Ok(stream) => stream,
            Err(e) => {
                eprintln!("{} Failed to connect to plant server at {}", "❌".red(), addr.bright_white());
                if e.kind() == std::io::ErrorKind::ConnectionRefused {
                    eprintln!("{} Server is not running. Start it with:", "💡".yellow());
                    eprintln!("   {}", "cargo run --bin plantbus-server".bright_cyan());
                } else {
                    eprintln!("{} Network error: {}", "🔌".yellow(), e.to_string().bright_red());
                }
                return Err(e.into());
            }
        };
        let (reader, writer) = stream.into_split();
        Ok(Self {
            lines: BufReader::new(reader).lines(),
            writer,
            next_id: 1,
        })
    }

    async fn send(&mut self, request_type: RequestType) -> CliResult<u32> {
        let id = self.next_id;
        self.next_id += 1;
        let request = Request {
            id,
            timestamp: now_ms(),
            request_type,
        };
        let line = serde_json::to_string(&request)?;
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        Ok(id)
    }

    /// Next server line, raw and decoded. `None` once the server hangs up.
    async fn next_message(&mut self) -> CliResult<Option<(String, ServerMessage)>> {
        loop {
            let Some(line) = self.lines.next_line().await? else {
                return Ok(None);
            };
            if line.trim().is_empty() {
                continue;
            }
            let message = serde_json::from_str::<ServerMessage>(&line)?;
            return Ok(Some((line, message)));
        }
    }

    /// Sends one request and waits for its response, skipping unrelated lines.
    async fn request(&mut self, request_type: RequestType) -> CliResult<(String, Response)> {
        let id = self.send(request_type).await?;
        let wait = async {
            while let Some((line, message)) = self.next_message().await? {
                match message {
                    ServerMessage::Response(response) if response.id == id || response.id == 0 => {
                        return Ok((line, response));
                    }
                    _ => continue,
                }
            }
            Err::<_, Box<dyn std::error::Error>>("Server closed connection".into())
        };
        match tokio::time::timeout(REQUEST_TIMEOUT, wait).await {
            Ok(result) => result,
            Err(_) => {
                eprintln!("{} Request timed out after {} seconds", "⏰".yellow(), REQUEST_TIMEOUT.as_secs());
                Err("Request timeout".into())
            }
        }
    }
}

struct Client<'a> {
    host: &'a str,
    port: u16,
    format: &'a str,
}

impl Client<'_> {
    async fn call(&self, request_type: RequestType) -> CliResult<(String, Response)> {
        let mut connection = Connection::open(self.host, self.port).await?;
        connection.request(request_type).await
    }

    /// Prints the raw line for `--format json`; returns `true` when the caller
    /// should render the response itself.
    fn render_raw(&self, raw: &str, response: &Response) -> bool {
        if self.format == "json" {
            println!("{}", raw);
            return false;
        }
        if !response.status.is_good() {
            let message = response.message.as_deref().unwrap_or("Request failed");
            println!("{} {}", "❌".red(), message.bright_red());
            return false;
        }
        true
    }

    async fn ping(&self) -> CliResult<()> {
        let (raw, response) = self.call(RequestType::Ping).await?;
        if self.render_raw(&raw, &response) {
            match self.format {
                "compact" => println!("{}", "PONG".bright_green()),
                _ => println!("{} {}", "✅".green(), "Plant server is responsive".bright_green()),
            }
        }
        Ok(())
    }

    async fn browse(&self) -> CliResult<()> {
        let (raw, response) = self.call(RequestType::Browse).await?;
        if !self.render_raw(&raw, &response) {
            return Ok(());
        }
        if let Some(ResponsePayload::Signals(signals)) = response.payload {
            print_signals(&signals, self.format);
        }
        Ok(())
    }

    async fn read(&self, signal: &str) -> CliResult<()> {
        let (raw, response) = self
            .call(RequestType::Read {
                signal: signal.to_string(),
            })
            .await?;
        if !self.render_raw(&raw, &response) {
            return Ok(());
        }
        if let Some(ResponsePayload::Sample(sample)) = response.payload {
            match self.format {
                "compact" => println!("{}", format_value(&sample)),
                _ => print_sample(signal, &sample),
            }
        }
        Ok(())
    }

    async fn write(&self, signal: &str, value: &str) -> CliResult<()> {
        let raw_value = match value.parse::<f64>() {
            Ok(number) => serde_json::json!(number),
            Err(_) => serde_json::json!(value),
        };
        let (raw, response) = self
            .call(RequestType::DashboardWrite {
                signal: signal.to_string(),
                value: raw_value,
            })
            .await?;
        if self.format == "json" {
            println!("{}", raw);
            return Ok(());
        }
        match response.payload {
            Some(ResponsePayload::Write(outcome)) => print_write_outcome(&outcome, self.format),
            _ => {
                let message = response.message.as_deref().unwrap_or("Write failed");
                println!("{} {}", "❌".red(), message.bright_red());
            }
        }
        Ok(())
    }

    async fn history(&self, matches: &ArgMatches<'_>) -> CliResult<()> {
        let max_count = parse_opt_u64(matches, "last")?.unwrap_or(0) as usize;
        let Some(signal) = matches.value_of("signal") else {
            return self.history_all(matches, max_count).await;
        };
        let (raw, response) = self
            .call(RequestType::HistoryRead {
                signal: signal.to_string(),
                start_time: parse_opt_u64(matches, "start")?,
                end_time: parse_opt_u64(matches, "end")?,
                max_count,
            })
            .await?;
        if !self.render_raw(&raw, &response) {
            return Ok(());
        }
        if let Some(ResponsePayload::History(samples)) = response.payload {
            match self.format {
                "compact" => {
                    let values: Vec<String> = samples.iter().map(format_value).collect();
                    println!("{}", values.join(" "));
                }
                _ => {
                    println!("{} {} ({} samples)", "📈".bright_blue(), signal.bright_white().bold(), samples.len());
                    println!("{}", "──────────────────────────────────────────".bright_white());
                    for sample in &samples {
                        println!("{:>15}  {:>10}  {}", sample.source_timestamp, format_value(sample), sample.status);
                    }
                }
            }
        }
        Ok(())
    }

    async fn history_all(&self, matches: &ArgMatches<'_>, max_count: usize) -> CliResult<()> {
        let (raw, response) = self
            .call(RequestType::HistoryAll {
                start_time: parse_opt_u64(matches, "start")?,
                end_time: parse_opt_u64(matches, "end")?,
                max_count,
            })
            .await?;
        if !self.render_raw(&raw, &response) {
            return Ok(());
        }
        if let Some(ResponsePayload::HistoryAll(history)) = response.payload {
            for (signal, samples) in &history {
                let values: Vec<String> = samples.iter().map(format_value).collect();
                match self.format {
                    "compact" => println!("{}={}", signal, values.join(",")),
                    _ => println!(
                        "{:<28} {:>4} samples  {}",
                        signal.as_str().bright_white(),
                        samples.len(),
                        values.join(" ").dimmed()
                    ),
                }
            }
        }
        Ok(())
    }

    async fn snapshot(&self) -> CliResult<()> {
        let (raw, response) = self.call(RequestType::Snapshot).await?;
        if !self.render_raw(&raw, &response) {
            return Ok(());
        }
        if let Some(ResponsePayload::Snapshot(samples)) = response.payload {
            for (signal, sample) in &samples {
                match self.format {
                    "compact" => println!("{}={}", signal, format_value(sample)),
                    _ => println!("{:<28} {:>10}  {}", signal.as_str().bright_white(), format_value(sample), sample.status),
                }
            }
        }
        Ok(())
    }

    async fn devices(&self) -> CliResult<()> {
        let (raw, response) = self.call(RequestType::Devices).await?;
        if !self.render_raw(&raw, &response) {
            return Ok(());
        }
        if let Some(ResponsePayload::Devices(devices)) = response.payload {
            print_devices(&devices, self.format);
        }
        Ok(())
    }

    async fn reset_history(&self) -> CliResult<()> {
        let (raw, response) = self.call(RequestType::ResetHistory).await?;
        if self.render_raw(&raw, &response) {
            println!("{} {}", "✅".green(), "History cleared".bright_green());
        }
        Ok(())
    }

    async fn subscribe(&self, matches: &ArgMatches<'_>) -> CliResult<()> {
        let signal = required(matches, "signal")?;
        let mut connection = Connection::open(self.host, self.port).await?;
        let (raw, response) = connection
            .request(RequestType::Subscribe {
                signal: signal.to_string(),
                sampling_interval_ms: parse_opt_u64(matches, "interval")?,
                queue_depth: parse_opt_u64(matches, "depth")?.map(|d| d as usize),
                discard_oldest: Some(!matches.is_present("reject")),
            })
            .await?;
        if !response.status.is_good() {
            self.render_raw(&raw, &response);
            return Ok(());
        }
        if self.format == "json" {
            println!("{}", raw);
        } else if let Some(ResponsePayload::Subscription {
            subscription_id,
            sampling_interval_ms,
            queue_depth,
            ..
        }) = response.payload
        {
            println!(
                "{} Subscription {} on {} (interval {} ms, depth {}). Press Ctrl+C to stop.",
                "📡".bright_blue(),
                subscription_id,
                signal.bright_white().bold(),
                sampling_interval_ms,
                queue_depth
            );
        }

        while let Some((raw, message)) = connection.next_message().await? {
            if let ServerMessage::Notification(notification) = message {
                match self.format {
                    "json" => println!("{}", raw),
                    _ => print_notification(&notification, self.format),
                }
            }
        }
        Ok(())
    }

    async fn monitor(&self) -> CliResult<()> {
        let mut connection = Connection::open(self.host, self.port).await?;
        let (raw, response) = connection.request(RequestType::MonitorBridge).await?;
        if !response.status.is_good() {
            self.render_raw(&raw, &response);
            return Ok(());
        }
        if self.format == "json" {
            println!("{}", raw);
        } else {
            println!("{}", "📡 Monitoring pub/sub bridge (Press Ctrl+C to stop)...".bright_blue().bold());
        }

        while let Some((raw, message)) = connection.next_message().await? {
            if let ServerMessage::Published(published) = message {
                match self.format {
                    "json" => println!("{}", raw),
                    _ => {
                        for data_set in &published.message.messages {
                            for (signal, value) in &data_set.payload {
                                println!(
                                    "{} #{:<6} {} {}={}",
                                    published.topic.dimmed(),
                                    data_set.sequence_number,
                                    data_set.timestamp,
                                    signal.bright_white(),
                                    value.display().bright_cyan()
                                );
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

fn format_value(sample: &Sample) -> String {
    sample.value.as_ref().map_or_else(|| "-".to_string(), Value::display)
}

fn print_sample(signal: &str, sample: &Sample) {
    let value = format_value(sample);
    let value = if sample.status.is_good() {
        value.bright_green()
    } else {
        value.yellow()
    };
    println!("{} {}", signal.bright_white().bold(), value);
    println!("  {} {}", "Status:".dimmed(), sample.status);
    println!("  {} {}", "Source time:".dimmed(), sample.source_timestamp);
    println!("  {} {}", "Server time:".dimmed(), sample.server_timestamp);
}

fn print_write_outcome(outcome: &WriteOutcome, format: &str) {
    match (format, outcome.success) {
        ("compact", true) => println!("{}", "OK".bright_green()),
        ("compact", false) => println!("{}", outcome.status.name().bright_red()),
        (_, true) => println!("{} {}", "✅".green(), outcome.message.bright_green()),
        (_, false) => {
            println!("{} {}", "❌".red(), outcome.message.bright_red());
            if outcome.status == plantbus::StatusCode::BadNotWritable {
                println!("{} Only DeviceN_Power signals accept writes", "💡".yellow());
            } else if outcome.status == plantbus::StatusCode::BadNodeIdUnknown {
                println!("{} List signals with: {}", "💡".yellow(), "plantbus browse".bright_cyan());
            }
        }
    }
}

fn print_signals(signals: &[SignalInfo], format: &str) {
    for info in signals {
        match format {
            "compact" => println!("{}", info.signal),
            _ => println!(
                "{:<28} {:<8} {:<6} {}",
                info.signal.as_str().bright_white(),
                info.data_type.as_str(),
                info.unit,
                if info.writable { "rw".bright_green() } else { "r".dimmed() }
            ),
        }
    }
}

fn print_devices(devices: &[DeviceView], format: &str) {
    for device in devices {
        match format {
            "compact" => {
                let values: Vec<String> = device
                    .variables
                    .iter()
                    .map(|v| format!("{}={}", v.info.name, v.display_value))
                    .collect();
                println!("{} {}", device.name, values.join(" "));
            }
            _ => {
                println!("\n{} {}", "🏭".bright_blue(), device.display_name.bright_blue().bold());
                println!("{}", "─────────────────────────────────".bright_blue());
                for variable in &device.variables {
                    let value = format!("{} {}", variable.display_value, variable.info.unit);
                    let value = if variable.quality.is_good() {
                        value.bright_cyan()
                    } else {
                        value.yellow()
                    };
                    println!("  {:<14} {}", variable.info.display_name, value);
                }
            }
        }
    }
}

fn print_notification(notification: &Notification, format: &str) {
    let values: Vec<String> = notification.samples.iter().map(format_value).collect();
    match format {
        "compact" => println!("{} {}", notification.signal, values.join(" ")),
        _ => {
            let line = format!("{} [{}] {}", notification.signal, notification.samples.len(), values.join(", "));
            if notification.overflow {
                println!("{} {}", line, format!("(overflow, {} dropped)", notification.dropped).yellow());
            } else {
                println!("{}", line);
            }
        }
    }
}
