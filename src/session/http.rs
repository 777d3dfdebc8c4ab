//! [`FormSession`] over plain HTTP.
//!
//! Models the current page as a static HTML form: selects, text inputs and
//! checkboxes are recorded locally and sent when a submit control is clicked.
//! Anchors with a real `href` are followed (or captured as a transfer when a
//! download capture is armed). Script-only controls cannot be executed and are
//! reported as [`Error::NotSupported`].

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::Method;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use super::{ElementHandle, FormSession, SelectChoice, SessionFactory, Transfer, WaitPolicy};
use crate::config::Config;
use crate::error::{Error, Result};

/// Builds [`HttpSession`]s sharing one configuration
#[derive(Clone, Debug)]
pub struct HttpSessionFactory {
    user_agent: String,
    request_timeout: Duration,
}

impl HttpSessionFactory {
    /// Factory using the configured user agent and request timeout
    pub fn new(config: &Config) -> Self {
        Self {
            user_agent: config.user_agent.clone(),
            request_timeout: config.request_timeout,
        }
    }
}

#[async_trait::async_trait]
impl SessionFactory for HttpSessionFactory {
    async fn open(&self) -> Result<Box<dyn FormSession>> {
        let session = HttpSession::new(&self.user_agent, self.request_timeout)?;
        Ok(Box::new(session))
    }
}

/// Request that produced the current page, kept for [`FormSession::reload`]
#[derive(Clone, Debug)]
struct PageRequest {
    method: Method,
    url: Url,
    fields: Vec<(String, String)>,
}

/// Cookie-keeping HTTP session with a local model of the current form
pub struct HttpSession {
    client: reqwest::Client,
    request_timeout: Duration,
    current: Option<PageRequest>,
    document: Option<String>,
    /// Field values set through select/fill/check, by field name
    overrides: BTreeMap<String, String>,
    capture_armed: bool,
    pending_transfer: Option<Transfer>,
}

impl HttpSession {
    /// Create a session with its own cookie jar
    pub fn new(user_agent: &str, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .user_agent(user_agent)
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            client,
            request_timeout,
            current: None,
            document: None,
            overrides: BTreeMap::new(),
            capture_armed: false,
            pending_transfer: None,
        })
    }

    fn require_document(&self) -> Result<&str> {
        self.document
            .as_deref()
            .ok_or_else(|| Error::Other("no page loaded".to_string()))
    }

    fn resolve(&self, href: &str) -> Result<Url> {
        let resolved = match &self.current {
            Some(page) => page.url.join(href),
            None => Url::parse(href),
        };
        resolved.map_err(|e| Error::Navigation {
            url: href.to_string(),
            reason: format!("invalid URL: {e}"),
            timed_out: false,
        })
    }

    async fn send(&self, request: &PageRequest, timeout: Duration) -> Result<(u16, Vec<u8>)> {
        let mut builder = self.client.request(request.method.clone(), request.url.clone());
        if !request.fields.is_empty() {
            builder = if request.method == Method::GET {
                builder.query(&request.fields)
            } else {
                builder.form(&request.fields)
            };
        }

        let url = request.url.to_string();
        let response = tokio::time::timeout(timeout, builder.send())
            .await
            .map_err(|_| Error::Navigation {
                url: url.clone(),
                reason: format!("no response within {} seconds", timeout.as_secs()),
                timed_out: true,
            })?
            .map_err(|e| Error::Navigation {
                url: url.clone(),
                reason: e.to_string(),
                timed_out: e.is_timeout() || e.is_connect(),
            })?;

        let status = response.status().as_u16();
        let body = tokio::time::timeout(timeout, response.bytes())
            .await
            .map_err(|_| Error::Navigation {
                url: url.clone(),
                reason: "body not received in time".to_string(),
                timed_out: true,
            })?
            .map_err(|e| Error::Navigation {
                url,
                reason: e.to_string(),
                timed_out: e.is_timeout(),
            })?;
        Ok((status, body.to_vec()))
    }

    /// Issue a page request and make its body the current document
    async fn load(&mut self, request: PageRequest, timeout: Duration) -> Result<()> {
        let (status, body) = self.send(&request, timeout).await?;
        if !(200..300).contains(&status) {
            return Err(Error::Navigation {
                url: request.url.to_string(),
                reason: format!("HTTP status {status}"),
                timed_out: false,
            });
        }
        tracing::debug!(url = %request.url, method = %request.method, bytes = body.len(), "Page loaded");
        self.document = Some(String::from_utf8_lossy(&body).into_owned());
        self.current = Some(request);
        self.overrides.clear();
        Ok(())
    }

    /// Record a field value after checking the field exists
    fn set_field(&mut self, field: &str, expected: &[&str], value: FieldValue) -> Result<()> {
        let doc = self.require_document()?;
        let target = find_field(doc, field, expected)?;
        let value = match value {
            FieldValue::Text(v) => v,
            FieldValue::Checked => target.checkbox_value,
            FieldValue::Choice(choice) => match choice {
                SelectChoice::Value(v) => {
                    if !target.options.iter().any(|o| *o == v) {
                        return Err(Error::FormFieldNotFound(format!(
                            "{field} has no option with value {v:?}"
                        )));
                    }
                    v
                }
                SelectChoice::Index(i) => target.options.get(i).cloned().ok_or_else(|| {
                    Error::FormFieldNotFound(format!("{field} has no option at index {i}"))
                })?,
            },
        };
        self.overrides.insert(target.name, value);
        Ok(())
    }
}

enum FieldValue {
    Text(String),
    Checked,
    Choice(SelectChoice),
}

#[async_trait::async_trait]
impl FormSession for HttpSession {
    async fn navigate(&mut self, url: &str, _wait: WaitPolicy, timeout: Duration) -> Result<()> {
        let url = self.resolve(url)?;
        let request = PageRequest {
            method: Method::GET,
            url,
            fields: Vec::new(),
        };
        self.load(request, timeout).await
    }

    async fn reload(&mut self, timeout: Duration) -> Result<()> {
        let request = self
            .current
            .clone()
            .ok_or_else(|| Error::Other("no page to reload".to_string()))?;
        self.load(request, timeout).await
    }

    async fn select_option(&mut self, field: &str, choice: SelectChoice) -> Result<()> {
        self.set_field(field, &["select"], FieldValue::Choice(choice))
    }

    async fn fill_text(&mut self, field: &str, value: &str) -> Result<()> {
        self.set_field(field, &["input", "textarea"], FieldValue::Text(value.to_string()))
    }

    async fn check(&mut self, field: &str) -> Result<()> {
        self.set_field(field, &["input"], FieldValue::Checked)
    }

    async fn click_nth(&mut self, selector: &str, index: usize) -> Result<()> {
        let target = {
            let doc = self.require_document()?;
            find_click_target(doc, selector, index)?
        };

        match target {
            ClickTarget::Link(href) => {
                let url = self.resolve(&href)?;
                let request = PageRequest {
                    method: Method::GET,
                    url,
                    fields: Vec::new(),
                };
                if self.capture_armed {
                    let (status, bytes) = self.send(&request, self.request_timeout).await?;
                    self.capture_armed = false;
                    self.pending_transfer = Some(Transfer {
                        url: Some(request.url.to_string()),
                        status,
                        bytes,
                    });
                    Ok(())
                } else {
                    self.load(request, self.request_timeout).await
                }
            }
            ClickTarget::Submit { form, button } => {
                let url = match &form.action {
                    Some(action) if !action.is_empty() => self.resolve(action)?,
                    _ => self
                        .current
                        .as_ref()
                        .map(|p| p.url.clone())
                        .ok_or_else(|| Error::Other("no page loaded".to_string()))?,
                };
                let method = if form.method.eq_ignore_ascii_case("post") {
                    Method::POST
                } else {
                    Method::GET
                };
                let mut fields = merge_fields(form.fields, &self.overrides);
                if let Some(pair) = button {
                    fields.push(pair);
                }
                let request = PageRequest {
                    method,
                    url,
                    fields,
                };
                self.load(request, self.request_timeout).await
            }
            ClickTarget::Scripted(what) => Err(Error::NotSupported(format!(
                "{what} requires script execution"
            ))),
        }
    }

    async fn wait_for_network_idle(&mut self, _timeout: Duration) -> Result<()> {
        // Every request completes before the call that issued it returns
        Ok(())
    }

    async fn begin_download_capture(&mut self) -> Result<()> {
        self.capture_armed = true;
        self.pending_transfer = None;
        Ok(())
    }

    async fn await_transfer(&mut self, _timeout: Duration) -> Result<Option<Transfer>> {
        self.capture_armed = false;
        Ok(self.pending_transfer.take())
    }

    async fn content(&mut self) -> Result<String> {
        self.require_document().map(str::to_string)
    }

    async fn locate(&mut self, selector: &str) -> Result<Vec<ElementHandle>> {
        let doc = self.require_document()?;
        locate_elements(doc, selector)
    }

    fn current_url(&self) -> Option<String> {
        self.current.as_ref().map(|p| p.url.to_string())
    }

    async fn close(&mut self) -> Result<()> {
        self.current = None;
        self.document = None;
        self.overrides.clear();
        self.pending_transfer = None;
        self.capture_armed = false;
        Ok(())
    }
}

pub(crate) fn parse_selector(selector: &str) -> Result<Selector> {
    Selector::parse(selector)
        .map_err(|e| Error::Other(format!("invalid selector {selector:?}: {e:?}")))
}

pub(crate) fn normalized_text(element: &ElementRef<'_>) -> String {
    element
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

fn handle_for(selector: &str, index: usize, element: &ElementRef<'_>) -> ElementHandle {
    ElementHandle {
        selector: selector.to_string(),
        index,
        tag: element.value().name().to_ascii_lowercase(),
        text: normalized_text(element),
        attributes: element
            .value()
            .attrs()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    }
}

fn locate_elements(doc: &str, selector: &str) -> Result<Vec<ElementHandle>> {
    let parsed = parse_selector(selector)?;
    let html = Html::parse_document(doc);
    Ok(html
        .select(&parsed)
        .enumerate()
        .map(|(i, el)| handle_for(selector, i, &el))
        .collect())
}

struct FieldTarget {
    name: String,
    options: Vec<String>,
    checkbox_value: String,
}

fn find_field(doc: &str, field: &str, expected_tags: &[&str]) -> Result<FieldTarget> {
    let parsed = parse_selector(field)?;
    let html = Html::parse_document(doc);
    let element = html
        .select(&parsed)
        .next()
        .ok_or_else(|| Error::FormFieldNotFound(field.to_string()))?;

    let tag = element.value().name().to_ascii_lowercase();
    if !expected_tags.contains(&tag.as_str()) {
        return Err(Error::FormFieldNotFound(format!(
            "{field} is a <{tag}>, expected one of {expected_tags:?}"
        )));
    }

    let name = element
        .value()
        .attr("name")
        .or_else(|| element.value().attr("id"))
        .ok_or_else(|| Error::FormFieldNotFound(format!("{field} has no name")))?
        .to_string();

    let options = if tag == "select" {
        let option_selector = parse_selector("option")?;
        element
            .select(&option_selector)
            .map(|o| option_value(&o))
            .collect()
    } else {
        Vec::new()
    };

    Ok(FieldTarget {
        name,
        options,
        checkbox_value: element.value().attr("value").unwrap_or("on").to_string(),
    })
}

fn option_value(option: &ElementRef<'_>) -> String {
    option
        .value()
        .attr("value")
        .map(str::to_string)
        .unwrap_or_else(|| normalized_text(option))
}

struct FormSnapshot {
    method: String,
    action: Option<String>,
    fields: Vec<(String, String)>,
}

enum ClickTarget {
    Link(String),
    Submit {
        form: FormSnapshot,
        button: Option<(String, String)>,
    },
    Scripted(String),
}

fn find_click_target(doc: &str, selector: &str, index: usize) -> Result<ClickTarget> {
    let parsed = parse_selector(selector)?;
    let html = Html::parse_document(doc);
    let element = html
        .select(&parsed)
        .nth(index)
        .ok_or_else(|| Error::FormFieldNotFound(format!("{selector} (match {index})")))?;

    let tag = element.value().name().to_ascii_lowercase();
    if tag == "a" {
        return match element.value().attr("href").map(str::trim) {
            Some(href) if !href.is_empty() && !href.starts_with('#') && !is_script_href(href) => {
                Ok(ClickTarget::Link(href.to_string()))
            }
            _ => Ok(ClickTarget::Scripted(format!("link {selector}"))),
        };
    }

    let input_type = element
        .value()
        .attr("type")
        .unwrap_or(if tag == "button" { "submit" } else { "text" })
        .to_ascii_lowercase();
    let is_submit =
        (tag == "button" || tag == "input") && matches!(input_type.as_str(), "submit" | "image");
    let enclosing_form = element
        .ancestors()
        .filter_map(ElementRef::wrap)
        .find(|e| e.value().name() == "form");

    if is_submit && let Some(form) = enclosing_form {
        let button = element
            .value()
            .attr("name")
            .map(|n| (n.to_string(), element.value().attr("value").unwrap_or("").to_string()));
        return Ok(ClickTarget::Submit {
            form: snapshot_form(&form)?,
            button,
        });
    }

    Ok(ClickTarget::Scripted(format!("<{tag}> {selector}")))
}

fn is_script_href(href: &str) -> bool {
    href.to_ascii_lowercase().starts_with("javascript:")
}

fn snapshot_form(form: &ElementRef<'_>) -> Result<FormSnapshot> {
    let controls = parse_selector("input, select, textarea")?;
    let option_selector = parse_selector("option")?;
    let mut fields = Vec::new();

    for control in form.select(&controls) {
        let value = control.value();
        let Some(name) = value.attr("name") else {
            continue;
        };
        if value.attr("disabled").is_some() {
            continue;
        }
        match value.name().to_ascii_lowercase().as_str() {
            "select" => {
                let options: Vec<ElementRef<'_>> = control.select(&option_selector).collect();
                let chosen = options
                    .iter()
                    .find(|o| o.value().attr("selected").is_some())
                    .or_else(|| options.first());
                if let Some(option) = chosen {
                    fields.push((name.to_string(), option_value(option)));
                }
            }
            "textarea" => fields.push((name.to_string(), control.text().collect())),
            _ => {
                let kind = value.attr("type").unwrap_or("text").to_ascii_lowercase();
                match kind.as_str() {
                    "submit" | "button" | "image" | "reset" | "file" => {}
                    "checkbox" | "radio" => {
                        if value.attr("checked").is_some() {
                            let checked = value.attr("value").unwrap_or("on");
                            fields.push((name.to_string(), checked.to_string()));
                        }
                    }
                    _ => {
                        let text = value.attr("value").unwrap_or("");
                        fields.push((name.to_string(), text.to_string()));
                    }
                }
            }
        }
    }

    Ok(FormSnapshot {
        method: form.value().attr("method").unwrap_or("get").to_string(),
        action: form.value().attr("action").map(str::to_string),
        fields,
    })
}

/// Apply locally set values on top of the form's defaults, keeping document order
fn merge_fields(
    mut fields: Vec<(String, String)>,
    overrides: &BTreeMap<String, String>,
) -> Vec<(String, String)> {
    for (name, value) in overrides {
        match fields.iter_mut().find(|(n, _)| n == name) {
            Some(existing) => existing.1 = value.clone(),
            None => fields.push((name.clone(), value.clone())),
        }
    }
    fields
}
