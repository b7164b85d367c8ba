use std::sync::Arc;

use clap::{Parser, Subcommand};
use kyma_lifecycle_operator::{
    bridge::CrossClusterBridge,
    config::RunArgs,
    controller::{self, ControllerState},
    crd::Kyma,
    rest_api, telemetry, Error,
};
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator
    Run(RunArgs),
    /// Show version information
    Version,
    /// Show the Kymas known to the cluster
    Info(InfoArgs),
}

#[derive(Parser, Debug)]
struct InfoArgs {
    /// Restrict the listing to one namespace
    #[arg(long, env = "OPERATOR_NAMESPACE")]
    namespace: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("Kyma Lifecycle Operator v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Info(info_args) => run_info(info_args).await,
        Commands::Run(run_args) => run_operator(run_args).await,
    }
}

async fn run_info(args: InfoArgs) -> Result<(), Error> {
    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;

    let api: kube::Api<Kyma> = match &args.namespace {
        Some(ns) => kube::Api::namespaced(client, ns),
        None => kube::Api::all(client),
    };
    let kymas = api.list(&Default::default()).await?;

    println!("Managed Kymas: {}", kymas.items.len());
    for kyma in &kymas.items {
        let mut state = kyma
            .status
            .as_ref()
            .and_then(|s| s.state)
            .map_or_else(|| "-".to_string(), |s| s.to_string());
        if kyma.is_being_deleted() {
            state.push_str(" (deletion requested)");
        }
        println!(
            "  {}/{}\t{}\t{} module(s)",
            kyma.metadata.namespace.as_deref().unwrap_or("default"),
            kyma.metadata.name.as_deref().unwrap_or_default(),
            state,
            kyma.spec.modules.len()
        );
    }
    Ok(())
}

async fn run_operator(args: RunArgs) -> Result<(), Error> {
    args.validate()?;
    telemetry::init_telemetry(&args.telemetry_config())?;

    info!(
        "Starting Kyma Lifecycle Operator v{}",
        env!("CARGO_PKG_VERSION")
    );

    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;

    info!("Connected to Kubernetes cluster");

    let bridge = if args.enable_webhook_bridge {
        info!(
            "Webhook bridge enabled via gateway {}/{}",
            args.istio_gateway_namespace, args.istio_gateway_name
        );
        Some(CrossClusterBridge::new(
            client.clone(),
            args.gateway_config(),
            args.identity_settings(),
            None,
        ))
    } else {
        None
    };

    let state = Arc::new(ControllerState::new(
        client,
        args.reconciler_settings(),
        bridge,
    ));

    if let Some(addr) = args.http_address() {
        tokio::spawn(async move {
            if let Err(e) = rest_api::run_server(addr).await {
                tracing::error!("HTTP server error: {:?}", e);
            }
        });
    }

    let result = controller::run_controller(state).await;

    // Flush any remaining traces
    telemetry::shutdown_telemetry();

    result
}
