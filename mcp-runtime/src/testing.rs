//! In-memory stand-in for the `dbt` / `mf` command line tools.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::runner::{CommandError, CommandOutput, CommandRunner, Invocation};

type Handler = Box<dyn Fn(&Invocation) -> Result<CommandOutput, CommandError> + Send + Sync>;

pub(crate) const QUERY_TABLE: &str = "\
✔ Success 🦄 - query completed after 0.22 seconds
metric_time__month      revenue
--------------------  ---------
2024-01-01T00:00:00      1200.5
2024-02-01T00:00:00         980
";

/// Current and peak number of overlapping calls to one subcommand.
#[derive(Default)]
struct InFlight {
    now: AtomicUsize,
    peak: AtomicUsize,
}

impl InFlight {
    fn enter(&self) {
        let now = self.now.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.now.fetch_sub(1, Ordering::SeqCst);
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

pub(crate) struct ScriptedRunner {
    handler: Handler,
    delay: Duration,
    calls: Mutex<Vec<Invocation>>,
    listings: InFlight,
    dimension_lookups: InFlight,
}

impl ScriptedRunner {
    pub(crate) fn new<F>(handler: F) -> Self
    where
        F: Fn(&Invocation) -> Result<CommandOutput, CommandError> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
            listings: InFlight::default(),
            dimension_lookups: InFlight::default(),
        }
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of calls whose first argument is `subcommand` (`ls`, `list`, `query`).
    pub(crate) fn calls_to(&self, subcommand: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.args.first().is_some_and(|arg| arg == subcommand))
            .count()
    }

    pub(crate) fn max_concurrent_listings(&self) -> usize {
        self.listings.peak()
    }

    pub(crate) fn max_concurrent_dimension_lookups(&self) -> usize {
        self.dimension_lookups.peak()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput, CommandError> {
        self.calls.lock().unwrap().push(invocation.clone());
        let gauge = match invocation.args.first().map(String::as_str) {
            Some("ls") => Some(&self.listings),
            Some("list") => Some(&self.dimension_lookups),
            _ => None,
        };
        if let Some(gauge) = gauge {
            gauge.enter();
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(gauge) = gauge {
            gauge.leave();
        }
        (self.handler)(invocation)
    }
}

pub(crate) fn ok(stdout: impl Into<String>) -> CommandOutput {
    CommandOutput {
        exit_code: Some(0),
        stdout: stdout.into(),
        stderr: String::new(),
    }
}

pub(crate) fn failed(code: i32, stderr: impl Into<String>) -> CommandOutput {
    CommandOutput {
        exit_code: Some(code),
        stdout: String::new(),
        stderr: stderr.into(),
    }
}

/// A project whose listing, dimension and query commands answer from
/// `catalog`. Dimension lookups for metrics outside the catalog exit 1.
pub(crate) fn fake_project(catalog: &[(&str, &[&str])]) -> ScriptedRunner {
    let catalog: Vec<(String, Vec<String>)> = catalog
        .iter()
        .map(|(name, dims)| {
            (
                name.to_string(),
                dims.iter().map(|dim| dim.to_string()).collect(),
            )
        })
        .collect();

    ScriptedRunner::new(move |invocation| {
        match invocation.args.first().map(String::as_str) {
            Some("ls") => {
                let mut stdout = String::from("12:00:01  Running with dbt=1.8.3\n");
                for (name, _) in &catalog {
                    stdout.push_str(&format!(
                        "{{\"name\": \"{name}\", \"unique_id\": \"metric.fake.{name}\", \"description\": \"{name} from listing\"}}\n"
                    ));
                }
                Ok(ok(stdout))
            }
            Some("list") => {
                let metric = invocation.args.last().cloned().unwrap_or_default();
                match catalog.iter().find(|(name, _)| *name == metric) {
                    Some((_, dims)) => {
                        let mut stdout = format!(
                            "✔ 🌱 We've found {} common dimensions for metrics ['{metric}'].\n",
                            dims.len()
                        );
                        for dim in dims {
                            stdout.push_str(&format!("• {dim}\n"));
                        }
                        Ok(ok(stdout))
                    }
                    None => Ok(failed(1, format!("unknown metric {metric}"))),
                }
            }
            Some("query") => Ok(ok(QUERY_TABLE)),
            _ => Ok(failed(127, "unexpected command")),
        }
    })
}
