// ===============================
// src/metrics.rs
// ===============================
use std::convert::Infallible;
use std::net::SocketAddr;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, StatusCode};
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use tracing::{error, info};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Worker loop --------
pub static WORKER_ITERATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("worker_iterations_total", "completed worker ticks per symbol"),
        &["symbol"],
    )
    .unwrap()
});

pub static WORKER_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("worker_errors_total", "transient worker errors per symbol"),
        &["symbol"],
    )
    .unwrap()
});

// value = WorkerStatus::code()
pub static WORKER_STATUS: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("worker_status", "current worker status code (0 idle .. 6 stopped)"),
        &["symbol"],
    )
    .unwrap()
});

pub static FLEET_WORKERS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("fleet_workers", "workers in the registry").unwrap());

pub static PRICE_ALERTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("price_alerts_total", "tick-to-tick moves above the alert threshold"),
        &["symbol"],
    )
    .unwrap()
});

// -------- Signals --------
pub static SIGNALS_BY: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "signals_total_by",
            "generated signals by strategy & symbol (labels: strategy, symbol)",
        ),
        &["strategy", "symbol"],
    )
    .unwrap()
});

// decision: admitted | low_confidence | daily_cap | breaker | risk
pub static SIGNAL_DECISIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("signal_decisions_total", "worker admission decisions"),
        &["symbol", "decision"],
    )
    .unwrap()
});

// -------- Execution --------
pub static EXECUTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("executions_total", "execution attempts by result"),
        &["symbol", "result"],
    )
    .unwrap()
});

pub static SLIPPAGE_PIPS: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(
        HistogramOpts::new("execution_slippage_pips", "absolute slippage per fill (pips)")
            .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.0, 3.0, 5.0, 10.0]),
    )
    .unwrap()
});

pub static CLOSES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("position_closes_total", "closes accounted into the ledger"),
        &["symbol", "source"],
    )
    .unwrap()
});

// -------- Circuit breaker / ledger --------
pub static BREAKER_TRIPPED: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("breaker_tripped", "1 while the circuit breaker is open").unwrap());

pub static BREAKER_TRIPS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("breaker_trips_total", "circuit breaker trips by reason"),
        &["reason"],
    )
    .unwrap()
});

pub static LEDGER_BALANCE: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("ledger_balance", "current account balance").unwrap());

pub static LEDGER_DRAWDOWN_PCT: Lazy<Gauge> = Lazy::new(|| {
    Gauge::new("ledger_drawdown_pct", "drawdown from today's peak balance (percent)").unwrap()
});

// -------- Supervisor --------
pub static SUPERVISOR_RESTARTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("supervisor_restarts_total", "workers restarted out of Error"),
        &["symbol"],
    )
    .unwrap()
});

pub static BROKER_RECONNECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("broker_reconnects_total", "broker reconnect attempts by result"),
        &["result"],
    )
    .unwrap()
});

// ---- Config visibility ----
pub static CONFIG_STRATEGY_ACTIVE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_strategy_active", "active signal generator (label: strategy)"),
        &["strategy"],
    )
    .unwrap()
});

pub static CONFIG_SYMBOL: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_symbol", "configured symbols (label: symbol)"),
        &["symbol"],
    )
    .unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry; a second init() is a no-op.
    for m in [
        REGISTRY.register(Box::new(WORKER_ITERATIONS.clone())),
        REGISTRY.register(Box::new(WORKER_ERRORS.clone())),
        REGISTRY.register(Box::new(WORKER_STATUS.clone())),
        REGISTRY.register(Box::new(FLEET_WORKERS.clone())),
        REGISTRY.register(Box::new(PRICE_ALERTS.clone())),
        REGISTRY.register(Box::new(SIGNALS_BY.clone())),
        REGISTRY.register(Box::new(SIGNAL_DECISIONS.clone())),
        REGISTRY.register(Box::new(EXECUTIONS.clone())),
        REGISTRY.register(Box::new(SLIPPAGE_PIPS.clone())),
        REGISTRY.register(Box::new(CLOSES.clone())),
        REGISTRY.register(Box::new(BREAKER_TRIPPED.clone())),
        REGISTRY.register(Box::new(BREAKER_TRIPS.clone())),
        REGISTRY.register(Box::new(LEDGER_BALANCE.clone())),
        REGISTRY.register(Box::new(LEDGER_DRAWDOWN_PCT.clone())),
        REGISTRY.register(Box::new(SUPERVISOR_RESTARTS.clone())),
        REGISTRY.register(Box::new(BROKER_RECONNECTS.clone())),
        REGISTRY.register(Box::new(CONFIG_STRATEGY_ACTIVE.clone())),
        REGISTRY.register(Box::new(CONFIG_SYMBOL.clone())),
    ] {
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
pub fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

fn respond(req: &Request<Body>) -> Response<Body> {
    let mut resp = match req.uri().path() {
        "/" | "/metrics" => Response::new(Body::from(encode_metrics())),
        _ => {
            let mut r = Response::new(Body::from("not found\n"));
            *r.status_mut() = StatusCode::NOT_FOUND;
            r
        }
    };
    resp.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
    );
    resp
}

/// Serves `GET /` and `GET /metrics` on 0.0.0.0:`port` until the task is dropped.
pub fn serve_metrics(port: u16) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let make_svc = make_service_fn(|_| async {
            Ok::<_, Infallible>(service_fn(|req: Request<Body>| async move { Ok::<_, Infallible>(respond(&req)) }))
        });
        let server = match hyper::Server::try_bind(&addr) {
            Ok(b) => b.serve(make_svc),
            Err(e) => {
                error!(?e, %addr, "metrics bind failed");
                return;
            }
        };
        info!("metrics listening on http://{addr}/ (and /metrics)");
        if let Err(e) = server.await {
            error!(?e, %addr, "metrics server terminated");
        }
    })
}
