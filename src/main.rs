use std::{net::SocketAddr, path::Path, path::PathBuf, sync::Arc, time::Duration};

use bytes::Bytes;
use clap::Parser;
use color_eyre::{Result, eyre::Context};
use http::{StatusCode, header};
use serde::{Deserialize, Serialize};
use streamgate::{
    adapters::{
        DEFAULT_EXECUTOR, ExecutorRegistry, HttpBridge, MANAGE_EXECUTOR, PropertySource,
        SCHEDULED_EXECUTOR, standard_codecs,
    },
    config::{ServerConfig, ServerConfigValidator, loader::load_config},
    core::{
        FilterChain, HttpError, Reply, Request, Response, ResponseBody, Router,
        async_handler, path_spec::WILDCARD,
    },
    ports::ConfigSourceExt,
    reactive::{Flo, collectors},
    tracing_setup,
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "config.toml")]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Initialize a new configuration file
    Init {
        /// Output path for the new config file
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Start the server (default)
    Serve {
        /// Configuration file to use
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    match args.command {
        Some(Commands::Validate { config }) => validate_config_command(&config).await,
        Some(Commands::Init { config }) => init_config_command(&config).await,
        Some(Commands::Serve { config }) => serve(&config).await,
        None => serve(&args.config).await,
    }
}

async fn serve(config_path: &str) -> Result<()> {
    tracing_setup::init_tracing().context("Failed to initialize tracing")?;

    let (config, properties) = if Path::new(config_path).exists() {
        tracing::info!("Loading configuration from {config_path}");
        let config = load_config(config_path)
            .await
            .with_context(|| format!("Failed to load config from {config_path}"))?;
        (config, Some(PropertySource::load(config_path)?))
    } else {
        tracing::warn!("Configuration file {config_path} not found, using defaults");
        (ServerConfig::default(), None)
    };
    ServerConfigValidator::validate(&config).context("Invalid configuration")?;

    let greeting = match &properties {
        Some(properties) => properties.get_or("demo.greeting", "hello".to_string())?,
        None => "hello".to_string(),
    };

    let executors = {
        let _span = tracing_setup::configure_component_tracing("executors").entered();
        Arc::new(
            ExecutorRegistry::from_config(&config.executors)
                .context("Failed to start executors")?,
        )
    };
    let router = build_router(&config, &executors, greeting)?;

    let _heartbeat = {
        let stats = executors.clone();
        executors
            .scheduler(SCHEDULED_EXECUTOR)
            .context("Failed to start the scheduler")?
            .fixed_rate(
                "heartbeat",
                Duration::from_secs(60),
                Duration::from_secs(60),
                move || tracing::info!("streamgate alive with {} executors", stats.len()),
            )
    };

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .context("Failed to parse listen address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    tracing::info!(
        "streamgate listening on {} (routes: {}, filters: {}, max body: {} bytes)",
        addr,
        router.route_count(),
        router.filter_count(),
        config.max_content_length
    );
    println!("streamgate listening on {addr}");

    let app = HttpBridge::new(router, config.max_content_length).into_axum_router();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Graceful shutdown completed");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown..."),
        Err(e) => tracing::error!("Failed to listen for Ctrl+C: {}", e),
    }
}

#[derive(Debug, Deserialize)]
struct Order {
    item: String,
    quantity: u32,
}

#[derive(Debug, Serialize)]
struct Receipt {
    id: String,
    item: String,
    quantity: u32,
}

/// Demonstration routes covering filters, parameters, codecs, parallel
/// pipelines and streamed bodies.
fn build_router(
    config: &ServerConfig,
    executors: &Arc<ExecutorRegistry>,
    greeting: String,
) -> Result<Router> {
    let _span = tracing_setup::configure_component_tracing("router").entered();

    let codecs = Arc::new(standard_codecs());
    let parallel = executors.parallel_options(DEFAULT_EXECUTOR, MANAGE_EXECUTOR)?;

    let mut builder = Router::builder()
        .options(config.router_options())
        .filter("/admin/*", 0, |req: Request, chain: FilterChain| {
            if req.header("x-admin-token").is_some() {
                chain.next(req)
            } else {
                Reply::response(Response::text(
                    StatusCode::UNAUTHORIZED,
                    "Admin token required",
                ))
            }
        })
        .filter("/legacy/*", 10, |req: Request, chain: FilterChain| {
            let rest = req.path().trim_start_matches("/legacy").to_string();
            req.set_routing_path(format!("/hello{rest}"));
            chain.next(req)
        })
        .get("/health", |_req: Request| {
            Reply::response(Response::text(StatusCode::OK, "ok"))
        })
        .get("/hello/{name}", move |req: Request| {
            let name = req.param("name").unwrap_or("world");
            Reply::response(Response::text(StatusCode::OK, format!("{greeting} {name}")))
        });

    let stats = executors.clone();
    builder = builder.get("/admin/executors", move |_req: Request| {
        let body = serde_json::json!({ "executors": stats.len() });
        match Response::json(StatusCode::OK, &body) {
            Ok(response) => Reply::response(response),
            Err(e) => Reply::error(e),
        }
    });

    builder = builder.get("/squares/{count:[0-9]+}", move |req: Request| {
        let count = match req.param_as::<u64>("count") {
            Ok(count) => count,
            Err(e) => return Reply::error(e),
        };
        let flo = Flo::from_iter(1..=count)
            .parallel(parallel.clone())
            .map(|n| n * n)
            .collect(collectors::summing())
            .map(|sum: u64| Response::text(StatusCode::OK, sum.to_string()));
        Reply::from_flo(flo)
    });

    builder = builder.get("/stream/{count:[0-9]+}", |req: Request| {
        let count = match req.param_as::<u64>("count") {
            Ok(count) => count,
            Err(e) => return Reply::error(e),
        };
        let lines = Flo::from_iter(1..=count).map(|n| Bytes::from(format!("line {n}\n")));
        Reply::response(
            Response::ok()
                .with_header(
                    header::CONTENT_TYPE,
                    http::HeaderValue::from_static("text/plain; charset=utf-8"),
                )
                .with_body(ResponseBody::stream(lines.into_publisher())),
        )
    });

    let order_codecs = codecs.clone();
    builder = builder.post(
        "/orders",
        async_handler(move |req: Request| {
            let codecs = order_codecs.clone();
            async move {
                let order: Order = codecs.read(&req).await?;
                if order.quantity == 0 {
                    return Err(HttpError::bad_request("quantity must be positive"));
                }
                let receipt = Receipt {
                    id: req.id().to_string(),
                    item: order.item,
                    quantity: order.quantity,
                };
                codecs.write(&receipt, req.header(header::ACCEPT))
            }
        }),
    );

    if let Some(static_files) = &config.static_files {
        let root = PathBuf::from(&static_files.root);
        let template = format!("{}/*", static_files.url_prefix.trim_end_matches('/'));
        builder = builder.get(&template, move |req: Request| {
            let path = req.param(WILDCARD).unwrap_or_default().to_string();
            Reply::response(Response::ok().with_body(ResponseBody::file(root.clone(), path)))
        });
    }

    builder.build().context("Invalid route configuration")
}

/// Validate configuration file and exit
async fn validate_config_command(config_path: &str) -> Result<()> {
    println!("Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("Error: Configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config = match load_config(config_path).await {
        Ok(config) => {
            println!("Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("Configuration parsing failed:");
            eprintln!("   {e}");
            std::process::exit(1);
        }
    };

    match ServerConfigValidator::validate(&config) {
        Ok(()) => {
            println!("Configuration validation: OK");
            println!();
            println!("Configuration Summary:");
            println!("   Listen Address: {}", config.listen_addr);
            println!("   Max Content Length: {} bytes", config.max_content_length);
            println!(
                "   Case-insensitive Matching: {}",
                config.case_insensitive_matching
            );
            println!("   Debug Routing: {}", config.debug_request_routing);
            let mut names: Vec<_> = config.executors.iter().collect();
            names.sort_by(|a, b| a.0.cmp(b.0));
            for (name, executor) in names {
                println!(
                    "   Executor '{}': {} threads, buffer {}",
                    name, executor.threads, executor.buffer_size
                );
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration validation failed:");
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}

/// Initialize a new configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("Error: Configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    let default_config = r#"# streamgate configuration

# The address to listen on
listen_addr = "127.0.0.1:8080"

# Request body cap in bytes
max_content_length = 10485760

case_insensitive_matching = false
debug_request_routing = false

[executors.default]
threads = 4
buffer_size = 256

# threads = 0 runs tasks inline
[executors.manage]
threads = 1

# runs repeating tasks; must be a worker pool

[executors.scheduled]
threads = 1

# [static_files]
# root = "./static"
# url_prefix = "/static"

[demo]
greeting = "hello"
"#;

    tokio::fs::write(path, default_config)
        .await
        .context("Failed to write config file")?;
    println!("Created default configuration at: {config_path}");
    println!("   Run 'streamgate serve --config {config_path}' to start the server");
    Ok(())
}
