use clap::{Arg, Command};
use log::LevelFilter;
use sentwatch::alerts::AlertStore;
use sentwatch::classifier::GeminiClassifier;
use sentwatch::config::Config;
use sentwatch::dashboard;
use sentwatch::extract::FormatExtractor;
use sentwatch::mailbox::{GmailMailbox, InstalledAppCredentials};
use sentwatch::poller::Poller;
use std::process;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() {
    let matches = Command::new("sentwatch")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Watches a mailbox's sent items for sensitive data and suspicious recipients")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("sentwatch.yaml"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Validate configuration and credentials, then exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable debug logging")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("sentwatch.yaml");

    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            process::exit(1);
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {e}");
        process::exit(1);
    }

    let api_key = match config.api_key() {
        Ok(key) => key,
        Err(e) => {
            eprintln!("🚨 Error configuring classifier: {e}");
            process::exit(1);
        }
    };

    if matches.get_flag("test-config") {
        println!("✅ Configuration is valid");
        println!("   Poll interval: {}s", config.poll_interval_secs);
        println!("   Mailbox credentials: {}", config.mailbox.credentials_path);
        println!("   Mailbox token: {}", config.mailbox.token_path);
        println!("   Classifier model: {}", config.classifier.model);
        println!(
            "   Dashboard: {}:{}",
            config.dashboard.bind_address, config.dashboard.port
        );
        return;
    }

    if let Err(e) = run(config, api_key).await {
        log::error!("Fatal error: {e:#}");
        process::exit(1);
    }
}

async fn run(config: Config, api_key: String) -> anyhow::Result<()> {
    let mailbox_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.mailbox.request_timeout_secs))
        .user_agent(concat!("sentwatch/", env!("CARGO_PKG_VERSION")))
        .build()?;
    let classifier_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.classifier.request_timeout_secs))
        .user_agent(concat!("sentwatch/", env!("CARGO_PKG_VERSION")))
        .build()?;

    let credentials = Arc::new(
        InstalledAppCredentials::new(
            &config.mailbox.credentials_path,
            &config.mailbox.token_path,
            mailbox_client.clone(),
        )
        .with_consent_timeout(Duration::from_secs(config.mailbox.consent_timeout_secs)),
    );
    let mailbox = Arc::new(GmailMailbox::new(
        mailbox_client,
        &config.mailbox.api_base,
        credentials,
    ));
    let classifier = Arc::new(GeminiClassifier::new(
        classifier_client,
        &config.classifier.api_base,
        &config.classifier.model,
        api_key,
    ));

    let store = AlertStore::new();
    let poller = Poller::new(
        mailbox,
        Arc::new(FormatExtractor::new()),
        classifier,
        store.clone(),
        config.poll_interval(),
    );
    // Dropped with the runtime when the dashboard stops.
    let _poller = poller.spawn();

    let addr = config.dashboard_addr()?;
    dashboard::serve(store, addr, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::warn!("Failed to listen for shutdown signal: {e}");
            std::future::pending::<()>().await;
        }
        log::info!("Received shutdown signal, stopping");
    })
    .await
}

fn load_config(path: &str) -> anyhow::Result<Config> {
    if std::path::Path::new(path).exists() {
        Config::from_file(path)
    } else {
        log::warn!("Configuration file '{path}' not found, using default configuration");
        Ok(Config::default())
    }
}

fn generate_default_config(path: &str) {
    let config = Config::default();
    match config.to_file(path) {
        Ok(()) => {
            println!("Default configuration written to: {path}");
            println!("Set {} before starting.", config.classifier.api_key_env);
        }
        Err(e) => {
            eprintln!("Error writing configuration file: {e}");
            process::exit(1);
        }
    }
}
