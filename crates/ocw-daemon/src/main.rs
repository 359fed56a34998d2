// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! Daemon entry point: settings, posture gate, wiring, serve.

use anyhow::{Context, Result, bail};
use clap::Parser;
use ocw_approval::ApprovalStore;
use ocw_auth::check_posture;
use ocw_config::{ConfigStore, Settings, StateLayout, init_logging};
use ocw_core::EventKind;
use ocw_daemon::{AppState, BridgeDeviceMap, LogRing, PresetStore, build_app};
use ocw_engine::{CallbackWatcher, DeadLetterLog, EngineClient, WatcherConfig};
use ocw_failover::{FailoverConfig, FailoverNote, FailoverRouter};
use ocw_gate::{InflightGate, RateLimiter};
use ocw_idempotency::IdempotencyStore;
use ocw_redact::{EventBus, TraceStore, TraceStoreConfig};
use ocw_safeio::IoPolicy;
use ocw_scheduler::{RunStore, RunStoreConfig, ScheduleAdmitter, ScheduleStore, Ticker, TickerConfig};
use ocw_template::TemplateRegistry;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "ocw-daemon", version, about = "OpenClaw control-plane daemon")]
struct Args {
    /// Bind address (overrides the environment).
    #[arg(long)]
    bind: Option<String>,

    /// State directory (overrides the environment).
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut settings = Settings::from_env().context("load settings from environment")?;
    if let Some(bind) = args.bind {
        settings.bind = bind;
    }
    if let Some(dir) = args.state_dir {
        settings.state_dir = dir;
    }

    let layout = StateLayout::create(&settings.state_dir).with_context(|| {
        format!("create state directory {}", settings.state_dir.display())
    })?;
    let filter = if args.debug { "ocw=debug,info" } else { "ocw=info,warn" };
    init_logging(filter, Some(&layout.log_file()), settings.log_truncate);

    // Posture gate: evaluated once against the locked snapshot; any
    // violation aborts before a single route is registered.
    let posture = settings.posture_snapshot(false);
    let violations = check_posture(&posture);
    if !violations.is_empty() {
        for violation in &violations {
            error!(%violation, "posture violation");
        }
        bail!("posture gate refused startup ({} violations)", violations.len());
    }

    // -- Observability substrate --------------------------------------------
    let traces = Arc::new(TraceStore::new(TraceStoreConfig::default()));
    let bus = Arc::new(EventBus::new());
    let logring = Arc::new(LogRing::new(4096));
    let _logring_task = logring.attach(&bus);

    // -- Stores --------------------------------------------------------------
    let idempotency = Arc::new(IdempotencyStore::new(4096, Duration::from_secs(600)));
    match idempotency.load(&layout.idempotency_json()) {
        Ok(n) if n > 0 => info!(entries = n, "idempotency entries restored"),
        Ok(_) => {}
        Err(err) => error!(error = %err, "idempotency restore failed; starting empty"),
    }
    let approvals = Arc::new(
        ApprovalStore::at_path(layout.approvals_json()).context("load approvals")?,
    );
    let schedules = Arc::new(
        ScheduleStore::at_path(layout.schedules_json()).context("load schedules")?,
    );
    let runs = Arc::new(
        RunStore::at_path(layout.runs_json(), RunStoreConfig::default())
            .map_err(anyhow::Error::msg)
            .context("load run history")?,
    );
    let config_store =
        Arc::new(ConfigStore::at_path(layout.config_json()).context("load config store")?);
    let presets = Arc::new(
        PresetStore::at_path(layout.presets_json())
            .map_err(anyhow::Error::msg)
            .context("load presets")?,
    );
    let bridge_devices = Arc::new(
        BridgeDeviceMap::load(
            &layout.root().join("bridge_tokens.json"),
            settings.safety.bridge_device_token.as_deref(),
            settings.safety.bridge_mtls.is_some(),
        )
        .map_err(anyhow::Error::msg)
        .context("load bridge devices")?,
    );
    let secrets = layout.load_secrets().context("load secrets")?;

    // -- Engine + watcher -----------------------------------------------------
    let engine = EngineClient::new(&settings.engine_url, Duration::from_secs(30))
        .map_err(|e| anyhow::anyhow!("engine client: {e}"))?;
    let deadletter = Arc::new(DeadLetterLog::default());
    let callback_policy = IoPolicy {
        allow_http: settings.safety.allow_insecure_base_url,
        allowed_hosts: settings.safety.callback_allow_hosts.clone(),
        allow_loopback_for: Default::default(),
        allow_private: settings.profile == ocw_auth::DeploymentProfile::Local,
        max_redirects: 3,
    };
    let watcher = Arc::new(CallbackWatcher::new(
        engine.clone(),
        callback_policy,
        Arc::clone(&traces),
        Arc::clone(&bus),
        Arc::clone(&deadletter),
        WatcherConfig {
            delivery_secrets: secrets,
            ..WatcherConfig::default()
        },
    ));

    // -- Failover -------------------------------------------------------------
    let observer_bus = Arc::clone(&bus);
    let observer_traces = Arc::clone(&traces);
    let failover = Arc::new(
        FailoverRouter::new(
            settings.llm_candidates.clone(),
            FailoverConfig {
                timeout: settings.budgets.llm_timeout,
                ..FailoverConfig::default()
            },
        )
        .with_observer(Arc::new(move |trace_id, note| {
            let (kind, payload) = match note {
                FailoverNote::Cooldown {
                    provider_id,
                    model,
                    class,
                } => (
                    EventKind::Cooldown,
                    serde_json::json!({"provider": provider_id, "model": model, "class": class}),
                ),
                FailoverNote::StormDrop { provider_id, model } => (
                    EventKind::StormDrop,
                    serde_json::json!({"provider": provider_id, "model": model}),
                ),
            };
            observer_traces.append(trace_id, kind, payload.clone());
            observer_bus.publish(trace_id, kind, payload);
        })),
    );

    // -- Shared state ---------------------------------------------------------
    let state = Arc::new(AppState {
        inflight: InflightGate::new(settings.budgets.inflight.clone()),
        limiter: Arc::new(RateLimiter::new()),
        templates: Arc::new(TemplateRegistry::with_builtins()),
        posture,
        traces,
        bus,
        logring,
        idempotency: Arc::clone(&idempotency),
        approvals: Arc::clone(&approvals),
        engine,
        watcher,
        deadletter,
        schedules: Arc::clone(&schedules),
        runs: Arc::clone(&runs),
        failover,
        config_store,
        presets,
        bridge_devices,
        started_at: Instant::now(),
        settings,
    });

    // -- Background loops -----------------------------------------------------
    let ticker = Arc::new(Ticker::new(
        schedules,
        runs,
        Arc::new(state.pipeline()) as Arc<dyn ScheduleAdmitter>,
        TickerConfig::default(),
    ));
    let _ticker_task = ticker.spawn();

    let sweeper_approvals = approvals;
    let _sweeper_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            match sweeper_approvals.sweep(chrono::Utc::now()) {
                Ok(expired) if expired > 0 => info!(expired, "approvals expired"),
                Ok(_) => {}
                Err(err) => error!(error = %err, "approval sweep failed"),
            }
        }
    });

    let persist_idempotency = idempotency;
    let persist_path = layout.idempotency_json();
    let _persist_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            if let Err(err) = persist_idempotency.persist(&persist_path) {
                error!(error = %err, "idempotency persist failed");
            }
        }
    });

    // -- Serve ----------------------------------------------------------------
    let app = build_app(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(&state.settings.bind)
        .await
        .with_context(|| format!("bind {}", state.settings.bind))?;
    info!(
        bind = %state.settings.bind,
        engine = %state.settings.engine_url,
        state_dir = %state.settings.state_dir.display(),
        "ocw-daemon listening"
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("serve")
}
