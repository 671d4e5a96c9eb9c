use std::process;
use std::sync::Arc;

use faktory_worker::utils::startup_banner::{print_startup_banner, version_line};
use faktory_worker::utils::timing::measure_execution;
use faktory_worker::{AppConfig, Client, LogLevel, Logger};
use serde_json::{Value, json};

const LOG_CONTEXT: &str = "main";

fn main() {
    print_startup_banner();

    let app_config = AppConfig::load_with_discovery(std::env::args().skip(1))
        .unwrap_or_else(|error| exit_with("configuration error", &error));
    let logger_config = app_config
        .logger_config()
        .unwrap_or_else(|error| exit_with("configuration error", &error));
    let logger = Arc::new(Logger::new(logger_config));
    let client_options = app_config
        .client_options()
        .unwrap_or_else(|error| exit_with("configuration error", &error));

    logger.log(
        LogLevel::Info,
        Some(LOG_CONTEXT),
        &format!("{} probing server", version_line()),
        Some(json!({
            "host": client_options.host,
            "port": client_options.port,
            "authenticated": client_options.password.is_some()
        })),
    );

    let client = Client::new(client_options, Arc::clone(&logger))
        .unwrap_or_else(|error| exit_with("client error", &error));
    let (info, _) = measure_execution("INFO", Some(LOG_CONTEXT), &logger, || {
        client.connect()?;
        client.info()
    });
    let info = info.unwrap_or_else(|error| {
        client.close();
        exit_with("server error", &error)
    });

    logger.log(
        LogLevel::Info,
        Some(LOG_CONTEXT),
        "server info received",
        Some(summarize(&info)),
    );
    client.close();
}

/// Picks the fields worth a log line out of an INFO reply.
fn summarize(info: &Value) -> Value {
    let server = &info["server"];
    let faktory = &info["faktory"];
    json!({
        "version": server["faktory_version"],
        "uptime": server["uptime"],
        "connections": server["connections"],
        "total_enqueued": faktory["total_enqueued"],
        "total_queues": faktory["total_queues"],
        "total_processed": faktory["total_processed"],
        "total_failures": faktory["total_failures"]
    })
}

fn exit_with(context: &str, error: &dyn std::error::Error) -> ! {
    eprintln!("{context}: {error}");
    process::exit(2);
}
