//! Listing markup, attachment endpoints and configuration for integration tests

use std::path::Path;
use std::time::Duration;

use mediador_crawler::{
    Config, DocumentType, DownloadToken, ListingRecord, Region, RetryConfig,
};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Path of the per-request summary view
pub const DETAIL_PATH: &str = "/sistemas/mediador/Resumo/ResumoVisualiza";

/// Smallest body the PDF signature check accepts
pub const PDF_BYTES: &[u8] = b"%PDF-1.4\n1 0 obj\n<<>>\nendobj\ntrailer\n%%EOF\n";

/// Error page the registry serves instead of a file
pub const HTML_ERROR_BODY: &[u8] =
    b"<!DOCTYPE html><html><body>Erro ao recuperar o arquivo</body></html>";

/// Party hash used by every fixture row
pub const PARTY_HASH: &str = "76535764032770";

/// One result row of a listing page
pub struct Row {
    /// Registry number
    pub registry_id: String,
    /// Request number, also the row marker
    pub request_id: String,
    /// "Tipo do Instrumento" value
    pub label: &'static str,
    /// Whether the row carries a download control
    pub with_token: bool,
}

/// Collective agreement row with a download control
pub fn row(registry_id: &str, request_id: &str) -> Row {
    Row {
        registry_id: registry_id.to_string(),
        request_id: request_id.to_string(),
        label: "Convenção Coletiva",
        with_token: true,
    }
}

/// Amendment row with a download control
pub fn amendment_row(registry_id: &str, request_id: &str) -> Row {
    Row {
        label: "Termo Aditivo de Convenção Coletiva",
        ..row(registry_id, request_id)
    }
}

/// Row whose attachment is not downloadable
pub fn row_without_token(registry_id: &str, request_id: &str) -> Row {
    Row {
        with_token: false,
        ..row(registry_id, request_id)
    }
}

/// Result page holding `rows`, with a "Próxima" link when `has_next`
pub fn listing_page(rows: &[Row], has_next: bool) -> String {
    let mut body = String::new();
    for r in rows {
        let download = if r.with_token {
            format!(
                r##"<a href="#" onclick="fDownload('{}','{PARTY_HASH}')">Download</a>"##,
                r.request_id
            )
        } else {
            String::new()
        };
        body.push_str(&format!(
            r##"
    <tr indice="{req}">
      <td><table class="TbForm">
        <tr><td>Nº do Registro:</td><td>{reg}</td><td>Nº da Solicitação:</td><td>{req}</td></tr>
        <tr><td>Tipo do Instrumento:</td><td>{label}</td><td>Vigência:</td><td>01/01/2023 - 31/12/2024</td></tr>
        <tr><td>Partes:</td><td>SINDICATO DOS EMPREGADOS<br>SINDICATO PATRONAL</td></tr>
        <tr><td colspan="2"><a href="#" onclick="fVisualizar('{req}')">Visualizar</a> {download}</td></tr>
      </table></td>
    </tr>"##,
            req = r.request_id,
            reg = r.registry_id,
            label = r.label,
        ));
    }
    let pager = if has_next {
        r##"<div class="paginacao"><a href="#" onclick="fPaginar()">Próxima</a></div>"##
    } else {
        r#"<div class="paginacao"><span>Anterior</span></div>"#
    };
    format!(
        r#"<html><body>
<div id="grdInstrumentos">
  <table class="Dados Tb01">
    <tr><th>Instrumentos</th></tr>{body}
  </table>
  {pager}
</div>
</body></html>"#
    )
}

/// Serve the summary view of `request_id` linking to an attachment with `body`
pub async fn mount_attachment(server: &MockServer, request_id: &str, body: &[u8], calls: u64) {
    let file_path = format!(
        "/sistemas/mediador/imagemAnexo/{}.pdf",
        request_id.replace('/', "_")
    );
    Mock::given(method("GET"))
        .and(path(DETAIL_PATH))
        .and(query_param("nrSolicitacao", request_id))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!(
            r#"<html><body><table><tr><td>Anexo:</td>
            <td><a href="{file_path}">instrumento</a></td></tr></table></body></html>"#
        )))
        .expect(calls)
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(file_path))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/pdf")
                .set_body_bytes(body.to_vec()),
        )
        .expect(calls)
        .mount(server)
        .await;
}

/// Answer every summary view request for `request_id` with 503
pub async fn mount_unavailable_detail(server: &MockServer, request_id: &str, calls: u64) {
    Mock::given(method("GET"))
        .and(path(DETAIL_PATH))
        .and(query_param("nrSolicitacao", request_id))
        .respond_with(ResponseTemplate::new(503))
        .expect(calls)
        .mount(server)
        .await;
}

/// Fast configuration for one region and type, two years, one window
pub fn test_config(server: &MockServer, data_root: &Path) -> Config {
    Config {
        data_root: data_root.to_path_buf(),
        base_url: format!("{}/sistemas/mediador/ConsultarInstColetivo", server.uri()),
        max_workers: 2,
        min_request_interval: Duration::ZERO,
        start_year: 2022,
        end_year: Some(2023),
        max_window_years: 2,
        request_timeout: Duration::from_secs(5),
        transfer_timeout: Duration::from_secs(5),
        regions: vec![Region::Ac],
        document_types: vec![DocumentType::Cct],
        retry: RetryConfig {
            max_attempts: 2,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
            backoff_multiplier: 2.0,
            jitter: false,
        },
        ..Config::default()
    }
}

/// Listing record as the extractor would produce it
pub fn listing_record(registry_id: &str, request_id: &str) -> ListingRecord {
    ListingRecord {
        registry_id: registry_id.to_string(),
        request_id: request_id.to_string(),
        document_type: DocumentType::Cct,
        document_type_label: "Convenção Coletiva".to_string(),
        validity_start: None,
        validity_end: None,
        parties: "SINDICATO DOS EMPREGADOS / SINDICATO PATRONAL".to_string(),
        download_token: (!request_id.is_empty()).then(|| DownloadToken {
            request_id: request_id.to_string(),
            party_hash: PARTY_HASH.to_string(),
        }),
    }
}
