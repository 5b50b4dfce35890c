// src/cmf/client.rs
// --- Imports ---
use crate::cmf::models::CompanyIdentity;
use crate::cmf::session::{FilingQuery, PageSession, SessionFactory};
use crate::config::SessionConfig;
use crate::utils::error::NavigationError;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use reqwest::{StatusCode, Url};
use scraper::{ElementRef, Html, Selector};

// --- CSS Selectors (Lazy Static) ---
static FORM_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("form#fm").expect("Failed to compile form selector"));
static INPUT_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("input[name]").expect("Failed to compile input selector"));
static SELECT_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("select").expect("Failed to compile select selector"));
static OPTION_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("option").expect("Failed to compile option selector"));
static ENTITY_DATA_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("#datos_ent").expect("Failed to compile entity data selector"));
static HEADING_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("h1, h2, h3, h4").expect("Failed to compile heading selector"));
static LINK_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("a").expect("Failed to compile link selector"));

// Field names of the entity form
const YEAR_FIELD: &str = "aa";
const MONTH_FIELD: &str = "mm";
const CONSOLIDATION_FIELD: &str = "tipo";
const STANDARD_FIELD: &str = "tipo_norma";

const STATEMENTS_HEADING: &str = "ESTADOS FINANCIEROS";
const XBRL_LINK_TEXT: &str = "estados financieros (xbrl)";

// --- Data Structures ---
#[derive(Debug, Clone)]
struct SelectField {
    name: String,
    /// (submitted value, visible text, selected)
    options: Vec<(String, String, bool)>,
}

impl SelectField {
    fn value_where<F: Fn(&str) -> bool>(&self, matches: F) -> Option<String> {
        self.options
            .iter()
            .find(|(_, text, _)| matches(text))
            .map(|(value, _, _)| value.clone())
    }

    fn default_value(&self) -> Option<String> {
        self.options
            .iter()
            .find(|(_, _, selected)| *selected)
            .or_else(|| self.options.first())
            .map(|(value, _, _)| value.clone())
    }
}

/// The period selection form of an entity page, reduced to what a submit needs.
#[derive(Debug, Clone)]
struct EntityForm {
    action: Url,
    post: bool,
    fixed: Vec<(String, String)>,
    selects: Vec<SelectField>,
}

impl EntityForm {
    fn parse(document: &Html, page_url: &Url) -> Option<Self> {
        let form = document.select(&FORM_SELECTOR).next()?;

        let action = match form.value().attr("action").map(str::trim) {
            Some(action) if !action.is_empty() => page_url.join(action).ok()?,
            _ => page_url.clone(),
        };
        let post = form
            .value()
            .attr("method")
            .map(|m| m.eq_ignore_ascii_case("post"))
            .unwrap_or(false);

        let fixed = form
            .select(&INPUT_SELECTOR)
            .filter(|input| {
                let kind = input.value().attr("type").unwrap_or("text").to_ascii_lowercase();
                !matches!(kind.as_str(), "button" | "reset" | "image" | "checkbox" | "radio")
            })
            .filter_map(|input| {
                let name = input.value().attr("name")?;
                Some((name.to_string(), input.value().attr("value").unwrap_or("").to_string()))
            })
            .collect();

        let selects = form.select(&SELECT_SELECTOR).filter_map(select_field).collect();

        Some(Self { action, post, fixed, selects })
    }

    fn field(&self, name: &str) -> Result<&SelectField, NavigationError> {
        self.selects
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| NavigationError::ElementNotFound(format!("select '{}'", name)))
    }

    /// Form fields for a query, or `None` when the period is not offered at all.
    fn fill(&self, query: &FilingQuery) -> Result<Option<Vec<(String, String)>>, NavigationError> {
        let year = query.period.year().to_string();
        let month_padded = format!("{:02}", query.period.month());
        let month_plain = query.period.month().to_string();

        let Some(year_value) = self.field(YEAR_FIELD)?.value_where(|text| text == year) else {
            return Ok(None);
        };
        let Some(month_value) = self
            .field(MONTH_FIELD)?
            .value_where(|text| text == month_padded || text == month_plain)
        else {
            return Ok(None);
        };
        let consolidation_value = self
            .field(CONSOLIDATION_FIELD)?
            .value_where(|text| text.eq_ignore_ascii_case(query.consolidation.form_label()))
            .ok_or_else(|| {
                NavigationError::ElementNotFound(format!("option '{}'", query.consolidation.form_label()))
            })?;
        let standard_value = self
            .field(STANDARD_FIELD)?
            .value_where(|text| query.standard.matches_option(text))
            .ok_or_else(|| NavigationError::ElementNotFound(format!("option '{}'", query.standard.form_label())))?;

        let mut fields = self.fixed.clone();
        for select in &self.selects {
            let value = match select.name.as_str() {
                YEAR_FIELD => Some(year_value.clone()),
                MONTH_FIELD => Some(month_value.clone()),
                CONSOLIDATION_FIELD => Some(consolidation_value.clone()),
                STANDARD_FIELD => Some(standard_value.clone()),
                _ => select.default_value(),
            };
            if let Some(value) = value {
                fields.push((select.name.clone(), value));
            }
        }
        Ok(Some(fields))
    }
}

fn select_field(select: ElementRef) -> Option<SelectField> {
    let name = select.value().attr("name").or_else(|| select.value().id())?.to_string();
    let options = select
        .select(&OPTION_SELECTOR)
        .map(|option| {
            let text = option.text().collect::<String>().trim().to_string();
            let value = option.value().attr("value").map(str::to_string).unwrap_or_else(|| text.clone());
            (value, text, option.value().attr("selected").is_some())
        })
        .collect();
    Some(SelectField { name, options })
}

/// Display name from the entity header block (second line when present).
fn entity_name(document: &Html) -> Option<String> {
    let block = document.select(&ENTITY_DATA_SELECTOR).next()?;
    let text = block.text().collect::<String>();
    let lines: Vec<&str> = text.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    lines.get(1).or_else(|| lines.first()).map(|s| s.to_string())
}

fn has_statements_view(markup: &str) -> bool {
    let document = Html::parse_document(markup);
    let found = document
        .select(&HEADING_SELECTOR)
        .any(|h| h.text().collect::<String>().to_uppercase().contains(STATEMENTS_HEADING));
    found
}

fn has_xbrl_link(markup: &str) -> bool {
    let document = Html::parse_document(markup);
    let found = document
        .select(&LINK_SELECTOR)
        .any(|a| a.text().collect::<String>().to_lowercase().contains(XBRL_LINK_TEXT));
    found
}

/// Maps HTTP status onto navigation failures and reads the body.
async fn read_body(response: reqwest::Response, label: &str) -> Result<String, NavigationError> {
    let status = response.status();
    if !status.is_success() {
        tracing::warn!("HTTP {} for {} ({})", status, label, response.url());
        return Err(match status {
            StatusCode::NOT_FOUND => NavigationError::CompanyNotFound(label.to_string()),
            StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
                NavigationError::TransientNetwork(format!("HTTP {}", status))
            }
            s if s.is_server_error() => NavigationError::TransientNetwork(format!("HTTP {}", s)),
            s => NavigationError::ElementNotFound(format!("HTTP {} for {}", s, label)),
        });
    }
    let body = response.text().await?;
    tracing::trace!("Read {} bytes for {}", body.len(), label);
    Ok(body)
}

// --- Factory ---

/// Opens plain HTTP sessions against the regulator's entity pages. Each session
/// carries its own cookie jar, so handles never share state.
#[derive(Debug, Clone)]
pub struct HttpSessionFactory {
    config: SessionConfig,
}

impl HttpSessionFactory {
    pub fn new(config: SessionConfig) -> Self {
        if !config.headless {
            tracing::info!("Visible mode requested; the HTTP backend has no window to show");
        }
        Self { config }
    }

    fn build_client(&self) -> Result<reqwest::Client, NavigationError> {
        let client = reqwest::Client::builder()
            .user_agent(self.config.user_agent.as_str())
            .timeout(self.config.step_timeout)
            .cookie_store(true)
            .build()?;
        Ok(client)
    }
}

#[async_trait]
impl SessionFactory for HttpSessionFactory {
    async fn open(&self, company: &CompanyIdentity) -> Result<Box<dyn PageSession>, NavigationError> {
        let label = company.tax_id.to_string();
        let url = self.config.entity_url(company.tax_id.number());
        let page_url = Url::parse(&url)
            .map_err(|e| NavigationError::ElementNotFound(format!("entity url '{}': {}", url, e)))?;

        let client = self.build_client()?;
        tracing::debug!("Opening entity page for {}: {}", label, page_url);
        let response = client.get(page_url.clone()).send().await?;
        let body = read_body(response, &label).await?;

        let (form, name) = {
            let document = Html::parse_document(&body);
            (EntityForm::parse(&document, &page_url), entity_name(&document))
        };

        let form = match (form, &name) {
            (Some(form), _) => form,
            (None, None) => return Err(NavigationError::CompanyNotFound(label)),
            (None, Some(_)) => return Err(NavigationError::ElementNotFound("form #fm".to_string())),
        };

        Ok(Box::new(HttpPageSession { client, form, name, label }))
    }
}

// --- Session ---

pub struct HttpPageSession {
    client: reqwest::Client,
    form: EntityForm,
    name: Option<String>,
    label: String,
}

impl HttpPageSession {
    async fn submit(&self, query: &FilingQuery) -> Result<Option<String>, NavigationError> {
        let Some(fields) = self.form.fill(query)? else {
            tracing::debug!("Period {} not offered for {}", query.period, self.label);
            return Ok(None);
        };

        let request = if self.form.post {
            self.client.post(self.form.action.clone()).form(&fields)
        } else {
            self.client.get(self.form.action.clone()).query(&fields)
        };
        let response = request.send().await?;
        read_body(response, &self.label).await.map(Some)
    }
}

#[async_trait]
impl PageSession for HttpPageSession {
    async fn select_period(&mut self, query: FilingQuery) -> Result<String, NavigationError> {
        let body = self
            .submit(&query)
            .await?
            .ok_or_else(|| NavigationError::ElementNotFound(format!("period {} not offered", query.period)))?;

        if !has_statements_view(&body) {
            return Err(NavigationError::ElementNotFound(format!(
                "statements view for {} {}",
                self.label, query.period
            )));
        }
        Ok(body)
    }

    async fn probe_link_presence(&mut self, query: FilingQuery) -> Result<bool, NavigationError> {
        match self.submit(&query).await? {
            Some(body) => Ok(has_xbrl_link(&body)),
            None => Ok(false),
        }
    }

    fn display_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    async fn close(self: Box<Self>) {
        tracing::trace!("Closing HTTP session for {}", self.label);
    }
}
