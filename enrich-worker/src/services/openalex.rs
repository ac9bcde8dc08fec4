use std::time;

use async_trait::async_trait;
use enrich_common::cache::normalize_key;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use url::Url;

use super::{check_status, http_client};
use crate::error::{ConfigError, QueryError, SetupError};
use crate::mapping::{joined_labels, lookup, text, FieldMapping, FieldMappings};
use crate::merger::MergePolicy;
use crate::record::Record;
use crate::service::{Document, EnrichmentService, LookupKey};

/// OpenAlex rejects filters with more than 100 values.
pub const OPENALEX_MAX_PACKET_SIZE: usize = 100;
const MAX_PER_PAGE: usize = 200;
const DOI_PREFIX: &str = "https://doi.org/";

static DOI_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^10\.\d{4,9}/\S+$").expect("doi pattern is a valid regex"));

fn doi(document: &Document) -> Option<Value> {
    let doi = lookup(document, "doi")?.as_str()?;
    Some(Value::String(doi.trim_start_matches(DOI_PREFIX).to_owned()))
}

fn usd(document: &Document, field: &str) -> Option<Value> {
    text(document, &format!("{field}.value_usd"))
}

pub fn openalex_mappings() -> Result<FieldMappings, ConfigError> {
    FieldMappings::new(vec![
        FieldMapping::new("id", "oa_id", |doc| text(doc, "id")),
        FieldMapping::new("doi", "oa_doi", doi),
        FieldMapping::new("type", "oa_type", |doc| text(doc, "type")),
        FieldMapping::new("open_access", "oa_open_access", |doc| {
            text(doc, "open_access.oa_status")
        }),
        FieldMapping::new("topics", "oa_domains", |doc| {
            joined_labels(doc, "topics", "domain.display_name", "|")
        }),
        FieldMapping::new("topics", "oa_fields", |doc| {
            joined_labels(doc, "topics", "field.display_name", "|")
        }),
        FieldMapping::new("topics", "oa_subfields", |doc| {
            joined_labels(doc, "topics", "subfield.display_name", "|")
        }),
        FieldMapping::new("apc_list", "oa_apc_list", |doc| usd(doc, "apc_list")),
        FieldMapping::new("apc_paid", "oa_apc_paid", |doc| usd(doc, "apc_paid")),
        FieldMapping::new("cited_by_count", "oa_cited_by_count", |doc| {
            // zero citations is left out
            match lookup(doc, "cited_by_count")?.as_u64()? {
                0 => None,
                count => Some(Value::String(count.to_string())),
            }
        }),
        FieldMapping::new("cited_by_api_url", "oa_cited_by_api_url", |doc| {
            text(doc, "cited_by_api_url")
        }),
        FieldMapping::new("fwci", "oa_fwci", |doc| text(doc, "fwci")),
        FieldMapping::new("grants", "oa_funders", |doc| {
            joined_labels(doc, "grants", "funder_display_name", "|")
        }),
        FieldMapping::new(
            "sustainable_development_goals",
            "oa_sustainable_development_goals",
            |doc| joined_labels(doc, "sustainable_development_goals", "display_name", "|"),
        ),
    ])
}

/// Client for the OpenAlex works API, looking records up by DOI.
pub struct OpenAlexClient {
    client: reqwest::Client,
    works_url: Url,
    mailto: Option<String>,
    api_key: Option<String>,
    mappings: FieldMappings,
    policy: MergePolicy,
}

impl OpenAlexClient {
    pub fn new(
        base_url: &str,
        mailto: Option<String>,
        api_key: Option<String>,
        request_timeout: time::Duration,
    ) -> Result<Self, SetupError> {
        Ok(Self {
            client: http_client(request_timeout)?,
            works_url: Url::parse(base_url)?.join("works")?,
            mailto,
            api_key,
            mappings: openalex_mappings()?,
            policy: MergePolicy::first_wins(),
        })
    }

    fn select(&self) -> String {
        let mut fields = self.mappings.source_fields();
        if !fields.contains(&"doi") {
            fields.push("doi");
        }
        fields.join(",")
    }
}

#[async_trait]
impl EnrichmentService for OpenAlexClient {
    fn name(&self) -> &str {
        "openalex"
    }

    fn max_packet_size(&self) -> usize {
        OPENALEX_MAX_PACKET_SIZE
    }

    fn mappings(&self) -> &FieldMappings {
        &self.mappings
    }

    fn merge_policy(&self) -> &MergePolicy {
        &self.policy
    }

    fn lookup_key(&self, record: &mut Record) -> LookupKey {
        let Some(doi) = record.get_str("doi") else {
            return LookupKey::Missing;
        };

        let doi = normalize_key(&doi);
        if DOI_PATTERN.is_match(&doi) {
            LookupKey::Key(doi)
        } else {
            LookupKey::Invalid(doi)
        }
    }

    fn document_keys(&self, document: &Document) -> Vec<String> {
        match document.get("doi").and_then(Value::as_str) {
            Some(doi) => vec![normalize_key(doi.trim_start_matches(DOI_PREFIX))],
            None => Vec::new(),
        }
    }

    async fn query(&self, keys: &[String], rows: usize) -> Result<Vec<Document>, QueryError> {
        let mut params = vec![
            ("filter", format!("doi:{}", keys.join("|"))),
            ("select", self.select()),
            ("per-page", rows.clamp(1, MAX_PER_PAGE).to_string()),
        ];
        if let Some(mailto) = &self.mailto {
            params.push(("mailto", mailto.to_owned()));
        }
        if let Some(api_key) = &self.api_key {
            params.push(("api_key", api_key.to_owned()));
        }

        let response = self
            .client
            .get(self.works_url.clone())
            .query(&params)
            .send()
            .await?;
        let response = check_status(response)?;

        let body: Value = response
            .json()
            .await
            .map_err(|e| QueryError::MalformedResponse(e.to_string()))?;

        let results = body
            .get("results")
            .or_else(|| body.get("message").and_then(|message| message.get("results")));

        match results {
            Some(Value::Array(items)) => Ok(items
                .iter()
                .filter_map(|item| item.as_object().cloned())
                .collect()),
            _ => Err(QueryError::MalformedResponse(
                "results is not a list".to_owned(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_json_diff::assert_json_eq;
    use httpmock::prelude::*;
    use serde_json::json;

    use super::*;
    use crate::test_utils::{document, record};

    fn client(server: &MockServer) -> OpenAlexClient {
        OpenAlexClient::new(
            &server.base_url(),
            Some("team@example.org".to_owned()),
            None,
            time::Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_lookup_key() {
        let client =
            OpenAlexClient::new("http://localhost/", None, None, time::Duration::from_secs(1))
                .unwrap();

        let mut valid = record(json!({"doi": "10.1371/Journal.Pone.0266781"}));
        let mut invalid = record(json!({"doi": "doi:nope"}));
        let mut missing = record(json!({"title": "no doi"}));

        assert_eq!(
            client.lookup_key(&mut valid),
            LookupKey::Key("10.1371/journal.pone.0266781".to_owned())
        );
        assert_eq!(client.lookup_key(&mut invalid), LookupKey::Invalid("doi:nope".to_owned()));
        assert_eq!(client.lookup_key(&mut missing), LookupKey::Missing);
    }

    #[test]
    fn test_mappings() {
        let mappings = openalex_mappings().unwrap();
        let work = document(json!({
            "id": "https://openalex.org/W1",
            "doi": "https://doi.org/10.1/ABC",
            "type": "article",
            "open_access": {"oa_status": "gold"},
            "topics": [
                {
                    "domain": {"display_name": "Life Sciences"},
                    "field": {"display_name": "Medicine"}
                },
                {
                    "domain": {"display_name": "Life Sciences"},
                    "field": {"display_name": "Biology"}
                },
            ],
            "apc_list": {"value_usd": 1500},
            "apc_paid": null,
            "cited_by_count": 0,
            "fwci": 2.5,
            "grants": [{"funder_display_name": "ANR"}, {"funder_display_name": "ANR"}],
        }));

        assert_json_eq!(
            Value::Object(mappings.apply(&work)),
            json!({
                "oa_id": "https://openalex.org/W1",
                "oa_doi": "10.1/ABC",
                "oa_type": "article",
                "oa_open_access": "gold",
                "oa_domains": "Life Sciences",
                "oa_fields": "Medicine|Biology",
                "oa_apc_list": "1500",
                "oa_fwci": "2.5",
                "oa_funders": "ANR",
            })
        );
    }

    #[tokio::test]
    async fn test_query_sends_batched_filter() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/works")
                    .query_param("filter", "doi:10.1/a|10.1/b")
                    .query_param("per-page", "4")
                    .query_param("mailto", "team@example.org");
                then.status(200).json_body(json!({
                    "meta": {"count": 1},
                    "results": [{"doi": "https://doi.org/10.1/A", "type": "article"}],
                }));
            })
            .await;
        let client = client(&server);

        let documents = client
            .query(&["10.1/a".to_owned(), "10.1/b".to_owned()], 4)
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(documents.len(), 1);
        assert_eq!(client.document_keys(&documents[0]), vec!["10.1/a".to_owned()]);
    }

    #[tokio::test]
    async fn test_query_status_errors() {
        let server = MockServer::start_async().await;
        let client = client(&server);
        let keys = vec!["10.1/a".to_owned()];

        let mut unauthorized = server
            .mock_async(|when, then| {
                when.method(GET).path("/works");
                then.status(401);
            })
            .await;
        let error = client.query(&keys, 2).await.unwrap_err();
        assert!(error.is_fatal());
        unauthorized.delete_async().await;

        let mut limited = server
            .mock_async(|when, then| {
                when.method(GET).path("/works");
                then.status(429).header("Retry-After", "2");
            })
            .await;
        let error = client.query(&keys, 2).await.unwrap_err();
        assert!(matches!(
            error,
            QueryError::RateLimited { reset_after: Some(reset) }
                if reset == time::Duration::from_secs(2)
        ));
        limited.delete_async().await;

        server
            .mock_async(|when, then| {
                when.method(GET).path("/works");
                then.status(200).json_body(json!({"results": "nope"}));
            })
            .await;
        let error = client.query(&keys, 2).await.unwrap_err();
        assert!(matches!(error, QueryError::MalformedResponse(_)));
    }
}
