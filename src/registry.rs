use crate::circuit_breaker::{registry_breaker_gate, BreakerGate};
use crate::errors::AppError;
use crate::models::RegistryRecord;
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;
use std::time::Duration;

/// Per-endpoint lookup timeout. The free registry services hang more often
/// than they 500.
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Strips formatting from a registry number. Returns the digits only when
/// exactly 14 remain; anything else is not a CNPJ.
pub fn normalize_cnpj(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() == 14 {
        Some(digits)
    } else {
        None
    }
}

fn cnpj_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // Formatted (11.222.333/0001-81) or bare 14-digit runs.
        Regex::new(r"\d{2}\.?\d{3}\.?\d{3}/?\d{4}-?\d{2}").unwrap()
    })
}

/// Extracts every CNPJ-normalizable pattern from free text, deduplicated in
/// first-seen order. Only matches that normalize to exactly 14 digits
/// survive.
pub fn extract_cnpj_candidates(text: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for m in cnpj_pattern().find_iter(text) {
        if let Some(cnpj) = normalize_cnpj(m.as_str()) {
            if !seen.contains(&cnpj) {
                seen.push(cnpj);
            }
        }
    }
    seen
}

/// The public registry services we try, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryProvider {
    BrasilApi,
    ReceitaWs,
    CnpjWs,
    MinhaReceita,
}

impl RegistryProvider {
    pub fn name(self) -> &'static str {
        match self {
            RegistryProvider::BrasilApi => "brasilapi",
            RegistryProvider::ReceitaWs => "receitaws",
            RegistryProvider::CnpjWs => "cnpj_ws",
            RegistryProvider::MinhaReceita => "minhareceita",
        }
    }

    fn default_base_url(self) -> &'static str {
        match self {
            RegistryProvider::BrasilApi => "https://brasilapi.com.br/api/cnpj/v1",
            RegistryProvider::ReceitaWs => "https://receitaws.com.br/v1/cnpj",
            RegistryProvider::CnpjWs => "https://publica.cnpj.ws/cnpj",
            RegistryProvider::MinhaReceita => "https://minhareceita.org",
        }
    }

    /// Maps this provider's response shape onto the canonical record. Each
    /// service invents its own field names for the same federal data.
    fn normalize(self, data: &Value, cnpj: &str) -> Result<RegistryRecord, AppError> {
        // ReceitaWS answers HTTP 200 with {"status": "ERROR"} for unknown numbers.
        if self == RegistryProvider::ReceitaWs
            && data.get("status").and_then(Value::as_str) == Some("ERROR")
        {
            return Err(AppError::ExternalApiError(format!(
                "receitaws has no record for {}",
                cnpj
            )));
        }

        let record = match self {
            RegistryProvider::BrasilApi | RegistryProvider::MinhaReceita => RegistryRecord {
                cnpj: cnpj.to_string(),
                legal_name: str_field(data, "razao_social"),
                trade_name: str_field(data, "nome_fantasia"),
                legal_nature: str_field(data, "natureza_juridica"),
                main_activity: str_field(data, "cnae_fiscal_descricao"),
                opening_date: str_field(data, "data_inicio_atividade"),
                registration_status: str_field(data, "descricao_situacao_cadastral"),
                capital: num_or_str_field(data, "capital_social"),
                street: str_field(data, "logradouro"),
                number: str_field(data, "numero"),
                neighborhood: str_field(data, "bairro"),
                city: str_field(data, "municipio"),
                state: str_field(data, "uf"),
                zip: str_field(data, "cep"),
                phone: str_field(data, "ddd_telefone_1"),
                email: str_field(data, "email"),
            },
            RegistryProvider::ReceitaWs => RegistryRecord {
                cnpj: cnpj.to_string(),
                legal_name: str_field(data, "nome"),
                trade_name: str_field(data, "fantasia"),
                legal_nature: str_field(data, "natureza_juridica"),
                main_activity: data
                    .get("atividade_principal")
                    .and_then(|a| a.get(0))
                    .and_then(|a| a.get("text"))
                    .and_then(Value::as_str)
                    .map(String::from),
                opening_date: str_field(data, "abertura"),
                registration_status: str_field(data, "situacao"),
                capital: num_or_str_field(data, "capital_social"),
                street: str_field(data, "logradouro"),
                number: str_field(data, "numero"),
                neighborhood: str_field(data, "bairro"),
                city: str_field(data, "municipio"),
                state: str_field(data, "uf"),
                zip: str_field(data, "cep"),
                phone: str_field(data, "telefone"),
                email: str_field(data, "email"),
            },
            RegistryProvider::CnpjWs => {
                let est = data.get("estabelecimento").unwrap_or(&Value::Null);
                RegistryRecord {
                    cnpj: cnpj.to_string(),
                    legal_name: str_field(data, "razao_social"),
                    trade_name: str_field(est, "nome_fantasia"),
                    legal_nature: data
                        .get("natureza_juridica")
                        .and_then(|n| n.get("descricao"))
                        .and_then(Value::as_str)
                        .map(String::from),
                    main_activity: est
                        .get("atividade_principal")
                        .and_then(|a| a.get("descricao"))
                        .and_then(Value::as_str)
                        .map(String::from),
                    opening_date: str_field(est, "data_inicio_atividade"),
                    registration_status: str_field(est, "situacao_cadastral"),
                    capital: num_or_str_field(data, "capital_social"),
                    street: str_field(est, "logradouro"),
                    number: str_field(est, "numero"),
                    neighborhood: str_field(est, "bairro"),
                    city: est
                        .get("cidade")
                        .and_then(|c| c.get("nome"))
                        .and_then(Value::as_str)
                        .map(String::from),
                    state: est
                        .get("estado")
                        .and_then(|s| s.get("sigla"))
                        .and_then(Value::as_str)
                        .map(String::from),
                    zip: str_field(est, "cep"),
                    phone: match (str_field(est, "ddd1"), str_field(est, "telefone1")) {
                        (Some(ddd), Some(tel)) => Some(format!("{}{}", ddd, tel)),
                        (None, Some(tel)) => Some(tel),
                        _ => None,
                    },
                    email: str_field(est, "email"),
                }
            }
        };

        if record.legal_name.is_none() && record.trade_name.is_none() {
            return Err(AppError::ExternalApiError(format!(
                "{} returned an empty record for {}",
                self.name(),
                cnpj
            )));
        }

        Ok(record)
    }
}

fn str_field(data: &Value, key: &str) -> Option<String> {
    data.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .map(String::from)
}

fn num_or_str_field(data: &Value, key: &str) -> Option<String> {
    match data.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

struct Endpoint {
    provider: RegistryProvider,
    base_url: String,
    breaker: Box<dyn BreakerGate>,
}

/// Resolves a registry number against the public CNPJ services.
///
/// Endpoints are tried in fixed order with a 5 s timeout each, stopping at
/// the first success. A per-endpoint circuit breaker skips services that
/// keep failing. `None` means every endpoint failed or timed out.
pub struct RegistryResolver {
    client: reqwest::Client,
    endpoints: Vec<Endpoint>,
}

impl RegistryResolver {
    pub fn new() -> Result<Self, AppError> {
        let providers = [
            RegistryProvider::BrasilApi,
            RegistryProvider::ReceitaWs,
            RegistryProvider::CnpjWs,
            RegistryProvider::MinhaReceita,
        ];
        Self::with_endpoints(
            providers
                .into_iter()
                .map(|p| (p, p.default_base_url().to_string()))
                .collect(),
        )
    }

    /// Custom endpoint list; tests point every provider at a mock server.
    pub fn with_endpoints(endpoints: Vec<(RegistryProvider, String)>) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(LOOKUP_TIMEOUT)
            .build()
            .map_err(|e| {
                AppError::ExternalApiError(format!("Failed to create registry client: {}", e))
            })?;

        Ok(Self {
            client,
            endpoints: endpoints
                .into_iter()
                .map(|(provider, base_url)| Endpoint {
                    provider,
                    base_url,
                    breaker: registry_breaker_gate(),
                })
                .collect(),
        })
    }

    /// Looks up one 14-digit registry number. Formatting in the input is
    /// tolerated; a non-normalizable input short-circuits to `None`.
    pub async fn resolve(&self, raw_cnpj: &str) -> Option<RegistryRecord> {
        let cnpj = normalize_cnpj(raw_cnpj)?;

        for endpoint in &self.endpoints {
            if !endpoint.breaker.is_call_permitted() {
                tracing::debug!(
                    "Registry endpoint {} circuit open, skipping",
                    endpoint.provider.name()
                );
                continue;
            }

            match self.lookup(endpoint, &cnpj).await {
                Ok(record) => {
                    endpoint.breaker.record_success();
                    tracing::info!(
                        "Registry lookup for {} resolved via {}",
                        cnpj,
                        endpoint.provider.name()
                    );
                    return Some(record);
                }
                Err(e) => {
                    endpoint.breaker.record_failure();
                    tracing::warn!(
                        "Registry endpoint {} failed for {}: {}",
                        endpoint.provider.name(),
                        cnpj,
                        e
                    );
                }
            }
        }

        tracing::warn!("All registry endpoints failed for {}", cnpj);
        None
    }

    async fn lookup(&self, endpoint: &Endpoint, cnpj: &str) -> Result<RegistryRecord, AppError> {
        let url = format!("{}/{}", endpoint.base_url, cnpj);

        let response = self.client.get(&url).send().await.map_err(|e| {
            AppError::ExternalApiError(format!("{} request failed: {}", endpoint.provider.name(), e))
        })?;

        if !response.status().is_success() {
            return Err(AppError::ExternalApiError(format!(
                "{} returned status {}",
                endpoint.provider.name(),
                response.status()
            )));
        }

        let data: Value = response.json().await.map_err(|e| {
            AppError::ExternalApiError(format!(
                "Failed to parse {} response: {}",
                endpoint.provider.name(),
                e
            ))
        })?;

        endpoint.provider.normalize(&data, cnpj)
    }
}

/// Municipality list from the national statistics service, for the
/// dashboard's location picker. Public data, no key, cached per state.
pub struct MunicipalityDirectory {
    client: reqwest::Client,
    base_url: String,
    cache: moka::future::Cache<String, Vec<String>>,
}

impl MunicipalityDirectory {
    const DEFAULT_BASE_URL: &'static str =
        "https://servicodados.ibge.gov.br/api/v1/localidades/estados";

    pub fn new() -> Result<Self, AppError> {
        Self::with_base_url(Self::DEFAULT_BASE_URL.to_string())
    }

    pub fn with_base_url(base_url: String) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(LOOKUP_TIMEOUT)
            .build()
            .map_err(|e| {
                AppError::ExternalApiError(format!("Failed to create IBGE client: {}", e))
            })?;

        Ok(Self {
            client,
            base_url,
            cache: moka::future::Cache::builder()
                .time_to_live(std::time::Duration::from_secs(86400))
                .max_capacity(64)
                .build(),
        })
    }

    /// Municipality names for one state (two-letter UF code).
    pub async fn list(&self, uf: &str) -> Result<Vec<String>, AppError> {
        let uf = uf.to_uppercase();
        if uf.len() != 2 || !uf.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(AppError::BadRequest(format!("Invalid state code '{}'", uf)));
        }

        if let Some(cached) = self.cache.get(&uf).await {
            return Ok(cached);
        }

        let url = format!("{}/{}/municipios", self.base_url, uf);
        let response = self.client.get(&url).send().await.map_err(|e| {
            AppError::ExternalApiError(format!("Municipality list request failed: {}", e))
        })?;

        if !response.status().is_success() {
            return Err(AppError::ExternalApiError(format!(
                "Municipality service returned status {}",
                response.status()
            )));
        }

        let data: Value = response.json().await.map_err(|e| {
            AppError::ExternalApiError(format!("Failed to parse municipality list: {}", e))
        })?;

        let names: Vec<String> = data
            .as_array()
            .map(|list| {
                list.iter()
                    .filter_map(|m| m.get("nome").and_then(Value::as_str).map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        self.cache.insert(uf, names.clone()).await;
        Ok(names)
    }
}
