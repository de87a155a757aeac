use carelink_core::config::{AppConfig, LoadOptions, MessagingProviderKind};
use carelink_db::{connect_from_config, ping, Store};
use serde::Serialize;

use crate::commands::CommandResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

pub fn run(json_output: bool) -> CommandResult {
    let report = build_report();
    let exit_code = if report.overall_status == CheckStatus::Pass { 0 } else { 1 };

    let output = if json_output {
        serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
            )
        })
    } else {
        render_human(&report)
    };

    CommandResult { exit_code, output }
}

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: "configuration loaded and validated".to_string(),
            });
            checks.push(check_messaging(&config));
            checks.extend(check_database_and_queue(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
            for name in ["messaging_readiness", "database_connectivity", "queue_health"] {
                checks.push(DoctorCheck {
                    name,
                    status: CheckStatus::Skipped,
                    details: "skipped because configuration did not load".to_string(),
                });
            }
        }
    }

    let all_pass = checks.iter().all(|check| check.status == CheckStatus::Pass);
    let overall_status = if all_pass { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if all_pass {
        "doctor: all readiness checks passed".to_string()
    } else {
        "doctor: one or more readiness checks failed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

fn check_messaging(config: &AppConfig) -> DoctorCheck {
    let details = match config.messaging.provider {
        MessagingProviderKind::Log => {
            "log-only provider: outbound messages are logged, not delivered".to_string()
        }
        MessagingProviderKind::Twilio => format!(
            "twilio provider sending from {}",
            config.messaging.from_number.as_deref().unwrap_or("<unset>")
        ),
    };
    DoctorCheck { name: "messaging_readiness", status: CheckStatus::Pass, details }
}

fn check_database_and_queue(config: &AppConfig) -> Vec<DoctorCheck> {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return vec![
                DoctorCheck {
                    name: "database_connectivity",
                    status: CheckStatus::Fail,
                    details: format!("failed to initialize async runtime: {error}"),
                },
                skipped_queue("runtime did not start"),
            ];
        }
    };

    runtime.block_on(async {
        let pool = match connect_from_config(&config.database).await {
            Ok(pool) => pool,
            Err(error) => {
                return vec![
                    DoctorCheck {
                        name: "database_connectivity",
                        status: CheckStatus::Fail,
                        details: format!("failed to connect to database: {error}"),
                    },
                    skipped_queue("database unreachable"),
                ];
            }
        };

        let database = match ping(&pool).await {
            Ok(()) => DoctorCheck {
                name: "database_connectivity",
                status: CheckStatus::Pass,
                details: format!("connected using `{}`", config.database.url),
            },
            Err(error) => DoctorCheck {
                name: "database_connectivity",
                status: CheckStatus::Fail,
                details: format!("database query failed: {error}"),
            },
        };

        let queue = if database.status == CheckStatus::Pass {
            let store = Store::sqlite(pool.clone(), config.worker.queue_config());
            match store.jobs.stats().await {
                Ok(stats) => DoctorCheck {
                    name: "queue_health",
                    status: CheckStatus::Pass,
                    details: format!(
                        "{} pending, {} failed, oldest pending {}",
                        stats.pending_count,
                        stats.failed_count,
                        stats
                            .oldest_pending_age_seconds
                            .map_or_else(|| "n/a".to_string(), |age| format!("{age}s"))
                    ),
                },
                Err(error) => DoctorCheck {
                    name: "queue_health",
                    status: CheckStatus::Fail,
                    details: format!("queue query failed (run `carelink migrate`?): {error}"),
                },
            }
        } else {
            skipped_queue("database unreachable")
        };

        pool.close().await;
        vec![database, queue]
    })
}

fn skipped_queue(reason: &str) -> DoctorCheck {
    DoctorCheck {
        name: "queue_health",
        status: CheckStatus::Skipped,
        details: format!("skipped because {reason}"),
    }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}
