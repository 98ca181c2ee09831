//! querystream - interactive SQL shell over a pooled, cancellable client

use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use comfy_table::{
    modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Cell, CellAlignment, Color,
    ContentArrangement, Table,
};
use querystream_core::normalize::{combine_errors, display_message};
use querystream_core::status::{humanize_row_count, TracingStatus};
use querystream_core::{
    ClientConfig, ClientError, ColumnDef, DbClient, LogFormat, OutputMode, QueryContext,
    QueryResult, Row, StatusHook, TimingResult, Value,
};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tracing::{debug, info};
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "querystream")]
#[command(about = "Interactive SQL shell for PostgreSQL and DuckDB", long_about = None)]
struct Args {
    /// postgres://..., key=value DSN, duckdb://path or :memory:
    #[arg(short, long, env = "QUERYSTREAM_CONNECTION_STRING")]
    connection_string: Option<String>,

    /// Statement to run non-interactively; repeat to run several in order
    #[arg(short, long)]
    query: Vec<String>,

    /// Configuration file (TOML, YAML or JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Report execution timing after each query
    #[arg(long)]
    timing: bool,

    /// table, csv, line or json
    #[arg(short, long)]
    output: Option<OutputMode>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut config =
        ClientConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    if let Some(connection_string) = &args.connection_string {
        config.connection_string = connection_string.clone();
    }
    if let Some(output) = args.output {
        config.output = output;
    }
    config.timing |= args.timing;
    init_tracing(&config, args.debug);

    if config.connection_string.is_empty() {
        bail!(
            "no connection string: pass --connection-string or set QUERYSTREAM_CONNECTION_STRING"
        );
    }

    let client = DbClient::connect(&QueryContext::new(), &config)
        .await
        .map_err(|err| anyhow::anyhow!(display_message(&err)))
        .context("failed to connect")?;
    if io::stderr().is_terminal() {
        client.set_status_hook(Arc::new(StatusLine));
    } else {
        client.set_status_hook(Arc::new(TracingStatus));
    }
    info!(output = ?config.output, timing = config.timing, "connected");

    let shell = Shell {
        client,
        output: config.output,
    };
    let result = if args.query.is_empty() {
        shell.interactive(args.debug).await
    } else {
        shell.run_batch(&args.query).await
    };
    shell.client.close();
    result
}

fn init_tracing(config: &ClientConfig, debug: bool) {
    let default_level = if debug { "info,querystream_core=debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if config.log_format == LogFormat::Json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .with_target(false)
            .with_file(true)
            .with_line_number(true)
            .with_span_events(FmtSpan::CLOSE)
            .init();
    } else {
        tracing_subscriber::fmt()
            .compact()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .with_target(false)
            .with_file(true)
            .with_line_number(true)
            .with_span_events(FmtSpan::CLOSE)
            .init();
    }
}

/// Progress on a single stderr line, erased when the query settles.
struct StatusLine;

impl StatusHook for StatusLine {
    fn set_status(&self, message: &str) {
        let mut stderr = io::stderr().lock();
        let _ = write!(stderr, "\r\x1b[2K{message}");
        let _ = stderr.flush();
    }

    fn done(&self) {
        let mut stderr = io::stderr().lock();
        let _ = write!(stderr, "\r\x1b[2K");
        let _ = stderr.flush();
    }
}

struct Shell {
    client: DbClient,
    output: OutputMode,
}

/// What one statement produced, for the summary line.
struct Outcome {
    rows: u64,
    error: Option<Arc<ClientError>>,
    timing: Option<TimingResult>,
}

impl Shell {
    async fn run_batch(&self, queries: &[String]) -> Result<()> {
        let mut failures: Vec<Arc<ClientError>> = Vec::new();
        for query in queries {
            match self.run(query).await {
                Ok(outcome) => failures.extend(outcome.error),
                Err(err) => failures.push(Arc::new(err)),
            }
        }
        match combine_errors("query failed", failures.iter().map(|err| err.as_ref())) {
            Some(message) => bail!(message),
            None => Ok(()),
        }
    }

    async fn interactive(&self, debug: bool) -> Result<()> {
        println!("querystream interactive SQL shell");
        println!("End statements with Enter. '.timing on|off' toggles timing, 'exit' quits.");
        println!("Ctrl-C cancels a running query; press it twice at the prompt to exit.\n");

        let mut rl = DefaultEditor::new()?;
        let history_file = dirs::home_dir()
            .map(|mut p| {
                p.push(".querystream_history");
                p
            })
            .unwrap_or_default();
        if history_file.exists() {
            let _ = rl.load_history(&history_file);
        }

        let mut interrupt_count = 0;
        loop {
            match rl.readline("querystream> ") {
                Ok(line) => {
                    interrupt_count = 0;
                    let input = line.trim();
                    if input.is_empty() {
                        continue;
                    }
                    let _ = rl.add_history_entry(input);

                    if input.eq_ignore_ascii_case("exit") || input.eq_ignore_ascii_case("quit") {
                        println!("Goodbye!");
                        break;
                    }
                    if let Some(rest) = input.strip_prefix(".timing") {
                        self.toggle_timing(rest.trim());
                        continue;
                    }

                    if let Err(err) = self.run(input).await {
                        eprintln!("Error: {}", display_message(&err));
                        if debug {
                            eprintln!("Details: {err:?}");
                        }
                    }
                    println!();
                }
                Err(ReadlineError::Interrupted) => {
                    interrupt_count += 1;
                    if interrupt_count >= 2 {
                        println!("\nGoodbye!");
                        break;
                    }
                    println!("^C (press Ctrl-C again to exit)");
                }
                Err(ReadlineError::Eof) => {
                    println!("Goodbye!");
                    break;
                }
                Err(err) => {
                    eprintln!("Error reading input: {err}");
                    break;
                }
            }
        }

        if !history_file.as_os_str().is_empty() {
            let _ = rl.save_history(&history_file);
        }
        Ok(())
    }

    fn toggle_timing(&self, arg: &str) {
        match arg {
            "on" => self.client.set_timing_enabled(true),
            "off" => self.client.set_timing_enabled(false),
            "" => {}
            other => {
                eprintln!("usage: .timing on|off (got '{other}')");
                return;
            }
        }
        let state = if self.client.timing_enabled() { "on" } else { "off" };
        println!("Timing is {state}");
    }

    /// Run one statement with Ctrl-C bound to its context.
    async fn run(&self, query: &str) -> Result<Outcome, ClientError> {
        let ctx = QueryContext::new();
        let interrupt = {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    debug!("interrupt received, cancelling query");
                    ctx.cancel();
                }
            })
        };

        let result = self.client.execute(&ctx, query, &[]).await;
        let outcome = match result {
            Ok(result) => Ok(self.render(&ctx, result).await),
            Err(err) => Err(err),
        };
        interrupt.abort();

        if let Ok(outcome) = &outcome {
            print_summary(outcome);
        }
        outcome
    }

    async fn render(&self, ctx: &QueryContext, result: QueryResult) -> Outcome {
        match self.output {
            OutputMode::Table => {
                let sync = result.collect(ctx).await;
                let rows: Vec<&Row> = sync.rows.iter().filter(|row| !row.is_error()).collect();
                if !sync.columns.is_empty() {
                    println!("{}", render_table(&sync.columns, &rows));
                }
                Outcome {
                    rows: rows.len() as u64,
                    error: sync.error,
                    timing: sync.timing,
                }
            }
            OutputMode::Json => {
                let sync = result.collect(ctx).await;
                let mut count = 0;
                for row in sync.rows.iter().filter(|row| !row.is_error()) {
                    println!("{}", json_line(&sync.columns, &row.values));
                    count += 1;
                }
                Outcome {
                    rows: count,
                    error: sync.error,
                    timing: sync.timing,
                }
            }
            OutputMode::Csv | OutputMode::Line => self.stream(ctx, result).await,
        }
    }

    /// Print rows as they arrive.
    async fn stream(&self, ctx: &QueryContext, result: QueryResult) -> Outcome {
        let QueryResult {
            columns,
            mut rows,
            timing,
        } = result;
        let mut stdout = io::stdout().lock();
        if self.output == OutputMode::Csv {
            let header: Vec<String> = columns.iter().map(|c| csv_field(&c.name)).collect();
            let _ = writeln!(stdout, "{}", header.join(","));
        }

        let mut count = 0;
        let mut error = None;
        loop {
            let row = tokio::select! {
                row = rows.next() => row,
                _ = ctx.done() => None,
            };
            let Some(row) = row else { break };
            if let Some(err) = row.error {
                error = Some(err);
                break;
            }
            let line = match self.output {
                OutputMode::Csv => row
                    .values
                    .iter()
                    .map(|v| csv_field(&v.to_string()))
                    .collect::<Vec<_>>()
                    .join(","),
                _ => row
                    .values
                    .iter()
                    .map(Value::to_string)
                    .collect::<Vec<_>>()
                    .join("\t"),
            };
            let _ = writeln!(stdout, "{line}");
            count += 1;
        }
        let _ = stdout.flush();
        rows.close();

        Outcome {
            rows: count,
            error,
            timing: timing.recv().await,
        }
    }
}

fn render_table(columns: &[ColumnDef], rows: &[&Row]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(columns.iter().map(|column| {
        Cell::new(&column.name)
            .fg(Color::Cyan)
            .set_alignment(CellAlignment::Center)
    }));
    for row in rows {
        table.add_row(row.values.iter().map(|value| Cell::new(value.to_string())));
    }
    table
}

fn json_line(columns: &[ColumnDef], values: &[Value]) -> serde_json::Value {
    let object = columns
        .iter()
        .zip(values)
        .map(|(column, value)| {
            let value = serde_json::to_value(value).unwrap_or(serde_json::Value::Null);
            (column.name.clone(), value)
        })
        .collect();
    serde_json::Value::Object(object)
}

fn csv_field(text: &str) -> String {
    if text.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", text.replace('"', "\"\""))
    } else {
        text.to_string()
    }
}

fn print_summary(outcome: &Outcome) {
    if let Some(err) = &outcome.error {
        eprintln!("Error: {}", display_message(err));
    }
    let plural = if outcome.rows == 1 { "" } else { "s" };
    match &outcome.timing {
        Some(timing) => {
            println!(
                "{} row{plural} in {:.3}s",
                humanize_row_count(outcome.rows),
                timing.duration.as_secs_f64()
            );
            if let Some(meta) = &timing.metadata {
                println!(
                    "rows fetched: {}, cached: {}, hydrate calls: {}",
                    meta.rows_fetched, meta.cached_rows_fetched, meta.hydrate_calls
                );
            }
        }
        None => println!("{} row{plural}", humanize_row_count(outcome.rows)),
    }
}
