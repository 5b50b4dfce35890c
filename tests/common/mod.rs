// tests/common/mod.rs
#![allow(dead_code)]

use async_trait::async_trait;
use cmf_extractor::cmf::{CompanyIdentity, FilingQuery, PageSession, Period, SessionFactory, TaxId};
use cmf_extractor::config::RetryPolicy;
use cmf_extractor::utils::NavigationError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How the fake regulator answers for one (company, period).
#[derive(Debug, Clone)]
pub enum Script {
    Page(String),
    Transient,
    Unpublished,
}

#[derive(Default)]
pub struct Counters {
    pub open_now: AtomicUsize,
    pub max_open: AtomicUsize,
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    pub requests: AtomicUsize,
}

/// In-memory stand-in for the regulator site.
#[derive(Clone, Default)]
pub struct ScriptedFactory {
    scripts: Arc<HashMap<(u32, u32), Script>>,
    latency: Duration,
    pub counters: Arc<Counters>,
}

impl ScriptedFactory {
    pub fn new(scripts: Vec<((u32, u32), Script)>, latency: Duration) -> Self {
        Self { scripts: Arc::new(scripts.into_iter().collect()), latency, counters: Arc::default() }
    }
}

#[async_trait]
impl SessionFactory for ScriptedFactory {
    async fn open(&self, company: &CompanyIdentity) -> Result<Box<dyn PageSession>, NavigationError> {
        let now = self.counters.open_now.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_open.fetch_max(now, Ordering::SeqCst);
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            rut: company.tax_id.number(),
            scripts: Arc::clone(&self.scripts),
            latency: self.latency,
            counters: Arc::clone(&self.counters),
        }))
    }
}

struct ScriptedSession {
    rut: u32,
    scripts: Arc<HashMap<(u32, u32), Script>>,
    latency: Duration,
    counters: Arc<Counters>,
}

impl ScriptedSession {
    async fn answer(&self, period: Period) -> Option<Script> {
        self.counters.requests.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;
        self.scripts.get(&(self.rut, period.key())).cloned()
    }
}

#[async_trait]
impl PageSession for ScriptedSession {
    async fn select_period(&mut self, query: FilingQuery) -> Result<String, NavigationError> {
        match self.answer(query.period).await {
            Some(Script::Page(markup)) => Ok(markup),
            Some(Script::Transient) => Err(NavigationError::TransientNetwork("connection reset".to_string())),
            Some(Script::Unpublished) | None => {
                Err(NavigationError::ElementNotFound(format!("no filing link for {}", query.period)))
            }
        }
    }

    async fn probe_link_presence(&mut self, query: FilingQuery) -> Result<bool, NavigationError> {
        match self.answer(query.period).await {
            Some(Script::Page(_)) => Ok(true),
            Some(Script::Transient) => Err(NavigationError::TransientNetwork("connection reset".to_string())),
            Some(Script::Unpublished) | None => Ok(false),
        }
    }

    async fn close(self: Box<Self>) {
        self.counters.open_now.fetch_sub(1, Ordering::SeqCst);
        self.counters.closed.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn company(number: u32, name: &str) -> CompanyIdentity {
    CompanyIdentity::new(TaxId::new(number), name)
}

pub fn period(key: u32) -> Period {
    Period::from_key(key).unwrap()
}

pub fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        backoff_base: Duration::from_millis(1),
        backoff_max: Duration::from_millis(5),
    }
}

/// One coded statement table: two category headers, three leaves under the
/// first and two under the second.
fn coded_table(code: &str, title: &str, column: &str) -> String {
    format!(
        r#"<table>
  <tr><th colspan="2">[{code}] {title}</th></tr>
  <tr><th>Concepto</th><th>{column}</th></tr>
  <tr><td class="abstract" title="{code}_A">Grupo uno [sinopsis]</td><td></td></tr>
  <tr><td style="padding-left: 20px" title="{code}_A1">Partida uno</td><td>1.000</td></tr>
  <tr><td style="padding-left: 20px" title="{code}_A2">Partida dos</td><td>(250)</td></tr>
  <tr><td style="padding-left: 20px" title="{code}_A3">Partida tres</td><td>-</td></tr>
  <tr><td class="abstract" title="{code}_B">Grupo dos [sinopsis]</td><td></td></tr>
  <tr><td style="padding-left: 20px" title="{code}_B1">Partida cuatro</td><td>12,5</td></tr>
  <tr><td style="padding-left: 20px" title="{code}_B2">Partida cinco</td><td>750</td></tr>
</table>"#
    )
}

/// Statements page in the coded IFRS layout with all three statements.
pub fn coded_page(period_key: u32) -> String {
    let p = period(period_key);
    let column = format!("{}", p.end_date().format("%d-%m-%Y"));
    format!(
        "<html><body>\n{}\n{}\n{}\n</body></html>",
        coded_table("210000", "Estado de situación financiera, corriente/no corriente", &column),
        coded_table("310000", "Estado del resultado, por función de gasto", &column),
        coded_table("510000", "Estado de flujos de efectivo, método directo", &column),
    )
}
