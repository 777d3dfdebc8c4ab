//! Search form mapping for the registry's "Consultar Instrumento Coletivo" page.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::pacer::RequestPacer;
use crate::session::{FormSession, SelectChoice, WaitPolicy};
use crate::types::ParameterTuple;

/// Value of the validity status select meaning "all"
const VALIDITY_STATUS_ALL: &str = "2";

/// Selectors of the search form controls
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchForm {
    /// Registration region select
    pub region: String,
    /// Instrument type select, chosen by option index
    pub document_type: String,
    /// "Registration period" checkbox
    pub registration_period: String,
    /// Registration period start date
    pub registration_start: String,
    /// Registration period end date
    pub registration_end: String,
    /// Validity status select
    pub validity_status: String,
    /// "Validity period" checkbox
    pub validity_period: String,
    /// Validity period start date
    pub validity_start: String,
    /// Validity period end date
    pub validity_end: String,
    /// Search button
    pub submit: String,
}

impl Default for SearchForm {
    fn default() -> Self {
        Self {
            region: "#cboUFRegistro".to_string(),
            document_type: "#cboTPRequerimento".to_string(),
            registration_period: "#chkPeriodoRegistro".to_string(),
            registration_start: "#txtDTInicioRegistro".to_string(),
            registration_end: "#txtDTFimRegistro".to_string(),
            validity_status: "#cboSTVigencia".to_string(),
            validity_period: "#chkVigencia".to_string(),
            validity_start: "#txtDTInicioVigencia".to_string(),
            validity_end: "#txtDTFimVigencia".to_string(),
            submit: "#btnPesquisar".to_string(),
        }
    }
}

impl SearchForm {
    /// Load the search page, fill it for `search` (whose `years` must already
    /// be a registry-sized window), and submit.
    ///
    /// Loading the page and submitting it are two requests and each waits for
    /// `pacer`. On success the session holds the first result page.
    pub async fn submit(
        &self,
        session: &mut dyn FormSession,
        pacer: &RequestPacer,
        search_url: &str,
        search: ParameterTuple,
        timeout: Duration,
    ) -> Result<()> {
        let ParameterTuple {
            region,
            document_type,
            years: window,
        } = search;

        pacer.acquire().await;
        session.navigate(search_url, WaitPolicy::Load, timeout).await?;

        session
            .select_option(&self.region, SelectChoice::Value(region.code().to_string()))
            .await?;
        session
            .select_option(
                &self.document_type,
                SelectChoice::Index(document_type.form_option_index()),
            )
            .await?;

        let first_day = window.first_day();
        let last_day = window.last_day();

        session.check(&self.registration_period).await?;
        session.fill_text(&self.registration_start, &first_day).await?;
        session.fill_text(&self.registration_end, &last_day).await?;

        // The site rejects the search unless both the status and the validity period are set
        session
            .select_option(
                &self.validity_status,
                SelectChoice::Value(VALIDITY_STATUS_ALL.to_string()),
            )
            .await?;
        session.check(&self.validity_period).await?;
        session.fill_text(&self.validity_start, &first_day).await?;
        session.fill_text(&self.validity_end, &last_day).await?;

        pacer.acquire().await;
        session.click(&self.submit).await?;
        session.wait_for_network_idle(timeout).await?;

        tracing::debug!(
            region = %region,
            document_type = %document_type,
            window = %window,
            "Search submitted"
        );
        Ok(())
    }
}
