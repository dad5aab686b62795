mod builder;
mod crd;
mod fetcher;
mod fetcher_config;
mod image_controller;
mod naming;
mod output_record;
mod storage;
mod util;

use std::{path::PathBuf, sync::Arc};

use clap::{Parser, Subcommand, crate_description, crate_version};
use futures::StreamExt;
use stackable_operator::{
    cli::{Command, ProductOperatorRun},
    k8s_openapi::api::{batch::v1::Job, core::v1::ConfigMap},
    kube::{
        CustomResourceExt,
        core::DeserializeGuard,
        runtime::{Controller, watcher},
    },
    logging::controller::report_controller_reconciled,
    telemetry::{Tracing, tracing::TelemetryArguments},
};
use tokio_util::sync::CancellationToken;

use crate::{
    builder::BuildArgs,
    fetcher::FetchArgs,
    crd::{OPERATOR_NAME, v1alpha1},
    image_controller::IMAGE_FULL_CONTROLLER_NAME,
};

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

#[derive(Parser)]
#[clap(about, author)]
struct Opts {
    #[clap(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    #[command(flatten)]
    Operator(Command),

    /// Build a LinuxKit image and upload the artifacts, run inside the build Job
    Build {
        #[command(flatten)]
        args: BuildArgs,

        #[command(flatten)]
        telemetry_arguments: TelemetryArguments,
    },

    /// Download bucket objects listed in the fetcher configuration, run as
    /// init container of the build Job
    Objfetch {
        #[command(flatten)]
        args: FetchArgs,

        #[command(flatten)]
        telemetry_arguments: TelemetryArguments,
    },

    /// Clone git repositories listed in the fetcher configuration, run as
    /// init container of the build Job
    Gitfetch {
        #[command(flatten)]
        args: FetchArgs,

        #[arg(long, env = "GIT_BIN", default_value = "git")]
        git: PathBuf,

        #[command(flatten)]
        telemetry_arguments: TelemetryArguments,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();

    match opts.cmd {
        Cmd::Operator(Command::Crd) => {
            serde_yaml::to_writer(std::io::stdout(), &v1alpha1::Image::crd())?;
        }
        Cmd::Operator(Command::Run(ProductOperatorRun {
            watch_namespace,
            telemetry_arguments,
            cluster_info_opts,
            ..
        })) => {
            let _tracing_guard =
                Tracing::pre_configured(built_info::PKG_NAME, telemetry_arguments).init()?;

            stackable_operator::utils::print_startup_string(
                crate_description!(),
                crate_version!(),
                built_info::GIT_VERSION,
                built_info::TARGET,
                built_info::BUILT_TIME_UTC,
                built_info::RUSTC_VERSION,
            );

            let client = stackable_operator::client::initialize_operator(
                Some(OPERATOR_NAME.to_string()),
                &cluster_info_opts,
            )
            .await?;

            let image_controller = Controller::new(
                watch_namespace.get_api::<DeserializeGuard<v1alpha1::Image>>(&client),
                watcher::Config::default(),
            )
            .owns(
                watch_namespace.get_api::<Job>(&client),
                watcher::Config::default(),
            )
            .owns(
                watch_namespace.get_api::<ConfigMap>(&client),
                watcher::Config::default(),
            )
            .shutdown_on_signal()
            .run(
                image_controller::reconcile_image,
                image_controller::error_policy,
                Arc::new(image_controller::Ctx {
                    client: client.clone(),
                }),
            )
            .map(|res| {
                report_controller_reconciled(&client, IMAGE_FULL_CONTROLLER_NAME, &res);
            });

            image_controller.collect::<()>().await;
        }
        Cmd::Build {
            args,
            telemetry_arguments,
        } => {
            let _tracing_guard =
                Tracing::pre_configured(built_info::PKG_NAME, telemetry_arguments).init()?;

            let cancel = CancellationToken::new();
            tokio::spawn(cancel_on_signal(cancel.clone()));

            builder::run(args, cancel).await?;
        }
        Cmd::Objfetch {
            args,
            telemetry_arguments,
        } => {
            let _tracing_guard =
                Tracing::pre_configured(built_info::PKG_NAME, telemetry_arguments).init()?;

            let cancel = CancellationToken::new();
            tokio::spawn(cancel_on_signal(cancel.clone()));

            fetcher::run_obj_fetch(args, cancel).await?;
        }
        Cmd::Gitfetch {
            args,
            git,
            telemetry_arguments,
        } => {
            let _tracing_guard =
                Tracing::pre_configured(built_info::PKG_NAME, telemetry_arguments).init()?;

            let cancel = CancellationToken::new();
            tokio::spawn(cancel_on_signal(cancel.clone()));

            fetcher::run_git_fetch(args, &git, cancel).await?;
        }
    }

    Ok(())
}

/// Cancels `cancel` on SIGINT or SIGTERM so that running work is torn down
/// together with the Pod.
async fn cancel_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(error) => {
                tracing::warn!(%error, "unable to listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    let _ = tokio::signal::ctrl_c().await;

    tracing::info!("received shutdown signal, cancelling");
    cancel.cancel();
}
