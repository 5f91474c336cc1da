//! Fiken accounting REST client.
//!
//! Implements `core::fiken::FikenApi` against the Fiken v2 API. Fiken answers resource creation
//! with `201 Created` and an empty body; the new id is the last path segment of the `Location`
//! header.

use crate::{
    core::{
        fiken::{FikenApi, RemoteSale, SaleDraft, Settlement, from_ore},
        settings::FikenSettings,
    },
    errors::{Error, Result},
    integrations::http::{ensure_success, read_json, transport_error},
};
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::header::{HeaderMap, LOCATION};
use serde::{Deserialize, Serialize};

pub const FIKEN_BASE_URL: &str = "https://api.fiken.no/api/v2";
const PROVIDER: &str = "fiken";

#[derive(Clone)]
pub struct FikenClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    company_slug: String,
}

/// A company the token has access to
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FikenCompany {
    pub name: String,
    pub slug: String,
    #[serde(default)]
    pub organization_number: Option<String>,
}

/// A bookkeeping account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FikenAccount {
    pub code: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FikenSale {
    sale_id: i64,
    date: NaiveDate,
    #[serde(default)]
    net_amount: i64,
    #[serde(default)]
    vat_amount: i64,
}

impl FikenClient {
    pub fn new(http: reqwest::Client, token: impl Into<String>, company_slug: impl Into<String>) -> Self {
        Self {
            http,
            base_url: FIKEN_BASE_URL.to_string(),
            token: token.into(),
            company_slug: company_slug.into(),
        }
    }

    /// Builds a client when the integration is enabled and both credentials are present.
    #[must_use]
    pub fn from_settings(http: &reqwest::Client, settings: &FikenSettings) -> Option<Self> {
        if !settings.is_ready() {
            return None;
        }
        let token = settings.api_token.as_deref()?;
        let slug = settings.company_slug.as_deref()?;
        Some(Self::new(http.clone(), token, slug))
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn company_url(&self, path: &str) -> String {
        format!("{}/companies/{}{path}", self.base_url, self.company_slug)
    }

    /// Companies visible to the token. Used to test a newly entered token.
    pub async fn companies(&self) -> Result<Vec<FikenCompany>> {
        let response = self
            .http
            .get(format!("{}/companies", self.base_url))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| transport_error(PROVIDER, &e))?;
        read_json(PROVIDER, response).await
    }

    /// Chart of accounts of the configured company.
    pub async fn accounts(&self) -> Result<Vec<FikenAccount>> {
        let response = self
            .http
            .get(self.company_url("/accounts"))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| transport_error(PROVIDER, &e))?;
        read_json(PROVIDER, response).await
    }

    async fn post_for_id<T>(&self, url: String, body: Option<&T>) -> Result<i64>
    where
        T: Serialize + Sync + ?Sized,
    {
        let mut request = self.http.post(url).bearer_auth(&self.token);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| transport_error(PROVIDER, &e))?;
        let response = ensure_success(PROVIDER, response).await?;
        id_from_location(response.headers())
    }
}

/// Extracts the created resource id from a `Location` header.
pub fn id_from_location(headers: &HeaderMap) -> Result<i64> {
    let location = headers
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| Error::Upstream {
            provider: PROVIDER,
            status: 201,
            message: "response has no Location header".to_string(),
        })?;
    location
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .and_then(|segment| segment.parse().ok())
        .ok_or_else(|| Error::Upstream {
            provider: PROVIDER,
            status: 201,
            message: format!("cannot read id from Location '{location}'"),
        })
}

#[async_trait]
impl FikenApi for FikenClient {
    async fn create_sale_draft(&self, draft: &SaleDraft) -> Result<i64> {
        let id = self
            .post_for_id(self.company_url("/sales/drafts"), Some(draft))
            .await?;
        tracing::debug!(draft_id = id, reference = %draft.reference, "Fiken draft created");
        Ok(id)
    }

    async fn create_sale_from_draft(&self, draft_id: i64) -> Result<i64> {
        let url = self.company_url(&format!("/sales/drafts/{draft_id}/createSale"));
        self.post_for_id::<()>(url, None).await
    }

    async fn settle_sale(&self, sale_id: i64, settlement: &Settlement) -> Result<()> {
        let response = self
            .http
            .put(self.company_url(&format!("/sales/{sale_id}/settled")))
            .bearer_auth(&self.token)
            .json(settlement)
            .send()
            .await
            .map_err(|e| transport_error(PROVIDER, &e))?;
        ensure_success(PROVIDER, response).await?;
        Ok(())
    }

    async fn sales_for_date(&self, date: NaiveDate) -> Result<Vec<RemoteSale>> {
        let day = date.format("%Y-%m-%d").to_string();
        let response = self
            .http
            .get(self.company_url("/sales"))
            .bearer_auth(&self.token)
            .query(&[("date", day.as_str()), ("pageSize", "100")])
            .send()
            .await
            .map_err(|e| transport_error(PROVIDER, &e))?;
        let sales: Vec<FikenSale> = read_json(PROVIDER, response).await?;
        Ok(sales
            .into_iter()
            .filter(|s| s.date == date)
            .map(|s| RemoteSale {
                sale_id: s.sale_id,
                date: s.date,
                total: from_ore(s.net_amount + s.vat_amount),
            })
            .collect())
    }
}
