use std::cmp::Ordering;
use std::collections::HashMap;
use std::time;

use async_trait::async_trait;
use enrich_common::cache::normalize_key;
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, warn};
use url::Url;

use super::{check_status, http_client};
use crate::error::{ConfigError, QueryError, SetupError};
use crate::mapping::{joined_values, lookup, text, FieldMapping, FieldMappings};
use crate::merger::MergePolicy;
use crate::record::{DiscardReason, Record, Verdict};
use crate::service::{Document, EnrichmentService, LookupKey};

pub const HAL_MAX_PACKET_SIZE: usize = 150;
const FIELDS: &str = "docid,halId_s,title_s,collId_i,collCode_s,domain_s,sid_i,status_i";
const MAX_SITES: &str = "10000";
/// `status_i` of the version currently online.
const ONLINE: i64 = 11;

fn is_online(document: &Document) -> bool {
    document.get("status_i").and_then(Value::as_i64) == Some(ONLINE)
}

fn prefer_online(candidate: &Document, current: &Document) -> Ordering {
    is_online(candidate).cmp(&is_online(current))
}

pub fn hal_mappings() -> Result<FieldMappings, ConfigError> {
    FieldMappings::new(vec![
        FieldMapping::new("docid", "hal_docid", |doc| text(doc, "docid")),
        FieldMapping::new("halId_s", "hal_identifiant", |doc| text(doc, "halId_s")),
        FieldMapping::new("title_s", "publication_title", |doc| {
            lookup(doc, "title_s")?.as_array()?.first().cloned()
        }),
        FieldMapping::new("collId_i", "hal_tampons", |doc| joined_values(doc, "collId_i", ",")),
        FieldMapping::new("collCode_s", "hal_tampons_name", |doc| {
            joined_values(doc, "collCode_s", ",")
        }),
        FieldMapping::new("domain_s", "hal_domains", |doc| joined_values(doc, "domain_s", ",")),
        FieldMapping::new("sid_i", "hal_sid", |doc| text(doc, "sid_i")),
    ])
}

/// Portals of the HAL instance, by id and by host.
#[derive(Debug, Default)]
pub struct SiteDirectory {
    urls: HashMap<String, String>,
    ids: HashMap<String, String>,
}

impl SiteDirectory {
    fn from_documents(documents: &[Document]) -> Self {
        let mut directory = Self::default();

        for site in documents {
            let (Some(id), Some(url)) = (
                text(site, "id").and_then(|id| id.as_str().map(str::to_owned)),
                site.get("url").and_then(Value::as_str),
            ) else {
                continue;
            };
            directory.ids.insert(host(url), id.clone());
            directory.urls.insert(id, url.to_owned());
        }

        directory
    }

    /// Site id of the portal served at `domain`.
    pub fn id_of(&self, domain: &str) -> Option<&str> {
        self.ids.get(&host(domain)).map(String::as_str)
    }

    pub fn url_of(&self, id: &str) -> Option<&str> {
        self.urls.get(id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.urls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }
}

fn host(url: &str) -> String {
    let url = url.trim();
    let url = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    url.trim_end_matches('/').to_lowercase()
}

/// Client for the HAL search API, looking records up by HAL identifier or
/// docid. Versions of a deposit are merged, the online one wins.
pub struct HalClient {
    client: reqwest::Client,
    search_url: Url,
    sites_url: Url,
    mappings: FieldMappings,
    policy: MergePolicy,
    sites: OnceCell<SiteDirectory>,
}

impl HalClient {
    pub fn new(base_url: &str, request_timeout: time::Duration) -> Result<Self, SetupError> {
        let base_url = Url::parse(base_url)?;

        Ok(Self {
            client: http_client(request_timeout)?,
            search_url: base_url.join("search/")?,
            sites_url: base_url.join("ref/instance/")?,
            mappings: hal_mappings()?,
            policy: MergePolicy::new(prefer_online, &["docid", "sid_i", "status_i"], &["collId_i"]),
            sites: OnceCell::new(),
        })
    }

    async fn search(
        &self,
        query: &str,
        fields: &str,
        rows: usize,
    ) -> Result<Vec<Document>, QueryError> {
        let rows = rows.to_string();
        let response = self
            .client
            .get(self.search_url.clone())
            .query(&[
                ("q", query),
                ("fl", fields),
                ("rows", rows.as_str()),
                ("wt", "json"),
            ])
            .send()
            .await?;

        docs(check_status(response)?).await
    }

    /// The site directory, loaded on first use. A failed load is retried on
    /// the next call.
    async fn sites(&self) -> Option<&SiteDirectory> {
        let loaded = self
            .sites
            .get_or_try_init(|| async {
                metrics::counter!("enrich_site_queries_total").increment(1);

                let response = self
                    .client
                    .get(self.sites_url.clone())
                    .query(&[
                        ("fl", "id,url"),
                        ("rows", MAX_SITES),
                        ("wt", "json"),
                    ])
                    .send()
                    .await?;
                let documents = docs(check_status(response)?).await?;

                let directory = SiteDirectory::from_documents(&documents);
                debug!("hal: loaded {} sites", directory.len());
                Ok::<_, QueryError>(directory)
            })
            .await;

        match loaded {
            Ok(directory) => Some(directory),
            Err(error) => {
                warn!("hal: failed to load the site directory: {error}");
                None
            }
        }
    }
}

async fn docs(response: reqwest::Response) -> Result<Vec<Document>, QueryError> {
    let body: Value = response
        .json()
        .await
        .map_err(|e| QueryError::MalformedResponse(e.to_string()))?;

    match body.get("response").and_then(|response| response.get("docs")) {
        Some(Value::Array(items)) => Ok(items
            .iter()
            .filter_map(|item| item.as_object().cloned())
            .collect()),
        _ => Err(QueryError::MalformedResponse(
            "response.docs is not a list".to_owned(),
        )),
    }
}

fn is_docid(key: &str) -> bool {
    !key.is_empty() && key.bytes().all(|b| b.is_ascii_digit())
}

#[async_trait]
impl EnrichmentService for HalClient {
    fn name(&self) -> &str {
        "hal"
    }

    fn max_packet_size(&self) -> usize {
        HAL_MAX_PACKET_SIZE
    }

    fn mappings(&self) -> &FieldMappings {
        &self.mappings
    }

    fn merge_policy(&self) -> &MergePolicy {
        &self.policy
    }

    fn lookup_key(&self, record: &mut Record) -> LookupKey {
        let redirection = matches!(
            record.get_str("status").as_deref(),
            Some("301" | "302" | "304")
        );
        record.set("hal_redirection", redirection);

        if let Some(docid) = record.get_str("hal_docid") {
            record.set("hal_docid", docid);
        }
        if let Some(collection) = record.get_str("hal_consult_collection") {
            record.set("hal_consult_collection", collection.to_uppercase());
        }
        let fulltext = record.get_str("mime").as_deref() == Some("PDF");
        record.set("hal_fulltext", fulltext);

        if let Some(Value::String(datetime)) = record.get("datetime") {
            let datetime = datetime.replace("+01:00", "Z");
            record.set("datetime", datetime);
        }
        let sized = match record.get("size") {
            None | Some(Value::Null | Value::Bool(false)) => false,
            Some(Value::String(size)) => !size.is_empty(),
            Some(_) => true,
        };
        if !sized {
            record.set("size", 0);
        }

        if record.get_str("platform").as_deref() != Some("hal") {
            return LookupKey::Missing;
        }

        match record
            .get_str("hal_identifiant")
            .or_else(|| record.get_str("hal_docid"))
        {
            Some(key) => LookupKey::Key(normalize_key(&key)),
            None => LookupKey::Missing,
        }
    }

    fn document_keys(&self, document: &Document) -> Vec<String> {
        let identifier = document.get("halId_s").and_then(Value::as_str);
        let docid = text(document, "docid");

        match (identifier, docid) {
            (Some(identifier), Some(Value::String(docid))) => {
                vec![normalize_key(identifier), docid]
            }
            _ => Vec::new(),
        }
    }

    async fn query(&self, keys: &[String], rows: usize) -> Result<Vec<Document>, QueryError> {
        let (docids, identifiers): (Vec<&str>, Vec<&str>) =
            keys.iter().map(String::as_str).partition(|key| is_docid(key));

        let mut clauses = Vec::new();
        if !identifiers.is_empty() {
            clauses.push(format!("halId_s:({})", identifiers.join(" OR ")));
        }
        if !docids.is_empty() {
            clauses.push(format!("docid:({})", docids.join(" OR ")));
        }
        if clauses.is_empty() {
            return Ok(Vec::new());
        }

        self.search(&clauses.join(" OR "), FIELDS, rows).await
    }

    /// Docids are never merged upstream, only HAL identifiers are.
    fn has_synonyms(&self, key: &str) -> bool {
        !is_docid(key)
    }

    async fn query_synonym(&self, key: &str) -> Result<Option<Document>, QueryError> {
        let documents = self
            .search(&format!("halIdSameAs_s:{key}"), FIELDS, 1)
            .await?;
        Ok(documents.into_iter().next())
    }

    async fn verdict(&self, record: &mut Record) -> Verdict {
        let Some(deposit_sid) = record.get_str("hal_sid") else {
            return Verdict::Keep;
        };

        let sites = self.sites().await;
        let domain = record.get_str("domain");
        let domain_sid = match (sites, &domain) {
            (Some(sites), Some(domain)) => sites.id_of(domain).map(str::to_owned),
            _ => None,
        };

        if record.get("hal_redirection") != Some(&Value::Bool(true)) {
            if let Some(sid) = domain_sid {
                record.set("hal_endpoint_portail_sid", sid);
            }
            if let Some(domain) = domain {
                record.set("hal_endpoint_portail", domain);
            }
            return Verdict::Keep;
        }

        record.set("hal_endpoint_portail_sid", deposit_sid.as_str());
        if let Some(url) = sites.and_then(|sites| sites.url_of(&deposit_sid)) {
            record.set("hal_endpoint_portail", url);
        }

        if record.get_str("hal_consult_collection").is_none()
            && domain_sid.as_deref() == Some(deposit_sid.as_str())
        {
            return Verdict::Discard(DiscardReason::Redirection);
        }

        if let Some(sid) = domain_sid {
            record.set("hal_redirect_portail_sid", sid);
        }
        if let Some(domain) = domain {
            record.set("hal_redirect_portail", domain);
        }
        Verdict::Keep
    }
}

#[cfg(test)]
mod tests {
    use assert_json_diff::assert_json_include;
    use httpmock::prelude::*;
    use serde_json::json;

    use std::sync::Arc;

    use enrich_common::cache::{Cache, CachedDocument, MockCache};

    use super::*;
    use crate::gate::CacheGate;
    use crate::merger::{ResultIndex, ResultMerger};
    use crate::packet::Packet;
    use crate::record::{BufferEntry, Continuation};
    use crate::report::Report;
    use crate::test_utils::{document, fields, record};

    fn client(server: &MockServer) -> HalClient {
        HalClient::new(&server.base_url(), time::Duration::from_secs(5)).unwrap()
    }

    async fn mock_sites(server: &MockServer) -> httpmock::Mock<'_> {
        server
            .mock_async(|when, then| {
                when.method(GET).path("/ref/instance/");
                then.status(200).json_body(json!({
                    "response": {"docs": [
                        {"id": 1, "url": "https://hal.science"},
                        {"id": 2, "url": "https://inria.hal.science/"},
                    ]}
                }));
            })
            .await
    }

    #[test]
    fn test_lookup_key_prepares_record() {
        let client = HalClient::new("http://localhost/", time::Duration::from_secs(1)).unwrap();
        let mut consultation = record(json!({
            "platform": "hal",
            "status": 302,
            "hal_docid": 123456,
            "hal_consult_collection": "inria",
            "mime": "PDF",
            "datetime": "2024-03-01T10:00:00+01:00",
        }));

        assert_eq!(client.lookup_key(&mut consultation), LookupKey::Key("123456".to_owned()));
        assert_json_include!(
            actual: fields(&consultation),
            expected: json!({
                "hal_redirection": true,
                "hal_docid": "123456",
                "hal_consult_collection": "INRIA",
                "hal_fulltext": true,
                "datetime": "2024-03-01T10:00:00Z",
                "size": 0,
            })
        );

        let mut sized = record(json!({
            "platform": "hal",
            "hal_identifiant": "hal-1",
            "size": 2048,
        }));
        assert_eq!(client.lookup_key(&mut sized), LookupKey::Key("hal-1".to_owned()));
        assert_eq!(sized.get("size"), Some(&json!(2048)));

        let mut other_platform =
            record(json!({"platform": "sciencedirect", "hal_identifiant": "hal-1"}));
        assert_eq!(client.lookup_key(&mut other_platform), LookupKey::Missing);
    }

    #[test]
    fn test_versions_merge_into_the_online_one() {
        let client = HalClient::new("http://localhost/", time::Duration::from_secs(1)).unwrap();
        let index = ResultIndex::build(
            vec![
                document(json!({
                    "halId_s": "hal-01", "docid": 10, "status_i": 111, "sid_i": 1, "collId_i": [5]
                })),
                document(json!({
                    "halId_s": "hal-01", "docid": 11, "status_i": 11, "sid_i": 2, "collId_i": [6]
                })),
            ],
            &client,
        );

        let merged = index.get("hal-01").unwrap();
        assert_eq!(merged["docid"], json!(11));
        assert_eq!(merged["sid_i"], json!(2));
        assert_eq!(merged["collId_i"], json!([5, 6]));
        assert!(index.get("10").is_some());
        assert_eq!(
            client.document_keys(merged),
            vec!["hal-01".to_owned(), "11".to_owned()]
        );
    }

    #[tokio::test]
    async fn test_query_splits_identifiers_and_docids() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/search/")
                    .query_param("q", "halId_s:(hal-01 OR tel-02) OR docid:(123)")
                    .query_param("rows", "6")
                    .query_param("wt", "json");
                then.status(200).json_body(json!({
                    "response": {"numFound": 1, "docs": [{"halId_s": "hal-01", "docid": 7}]}
                }));
            })
            .await;

        let keys = vec!["hal-01".to_owned(), "123".to_owned(), "tel-02".to_owned()];
        let documents = client(&server).query(&keys, 6).await.unwrap();

        mock.assert_async().await;
        assert_eq!(documents.len(), 1);
    }

    #[tokio::test]
    async fn test_synonym_lookup() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/search/")
                    .query_param("q", "halIdSameAs_s:hal-09");
                then.status(200).json_body(json!({
                    "response": {"docs": [{"halId_s": "hal-01", "docid": 7}]}
                }));
            })
            .await;

        let document = client(&server).query_synonym("hal-09").await.unwrap();

        mock.assert_async().await;
        assert_eq!(document.unwrap()["halId_s"], json!("hal-01"));
    }

    #[tokio::test]
    async fn test_unresolved_docid_is_cached_negative_without_synonym_lookup() {
        let server = MockServer::start_async().await;
        let synonym = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/search/")
                    .query_param("q", "halIdSameAs_s:123456");
                then.status(200).json_body(json!({"response": {"docs": []}}));
            })
            .await;

        let client = client(&server);
        assert!(client.has_synonyms("hal-09"));
        assert!(!client.has_synonyms("123456"));

        let cache = MockCache::new();
        let shared: Arc<dyn Cache> = Arc::new(cache.clone());
        let report = Arc::new(Report::new("hal"));
        let gate = Arc::new(CacheGate::new(Some(shared), report.clone()));

        let mut consultation = record(json!({"platform": "hal", "hal_docid": 123456}));
        assert_eq!(
            client.lookup_key(&mut consultation),
            LookupKey::Key("123456".to_owned())
        );
        let (continuation, completed) = Continuation::channel();
        let mut packet = Packet::default();
        packet.push(BufferEntry::new(consultation, continuation), "123456".to_owned());

        let merger = ResultMerger::new(Arc::new(client), gate, report.clone());
        merger.merge(packet, Vec::new()).await;

        assert!(completed.await.unwrap().is_keep());
        synonym.assert_hits_async(0).await;
        assert_eq!(report.snapshot().synonym_queries, 0);
        assert_eq!(cache.stored("123456"), Some(CachedDocument::Negative));
    }

    #[tokio::test]
    async fn test_redirection_to_the_deposit_portal_is_discarded() {
        let server = MockServer::start_async().await;
        let sites = mock_sites(&server).await;
        let client = client(&server);

        let mut redirected = record(json!({
            "hal_redirection": true,
            "hal_sid": "2",
            "domain": "inria.hal.science",
        }));
        assert_eq!(
            client.verdict(&mut redirected).await,
            Verdict::Discard(DiscardReason::Redirection)
        );

        let mut consultation = record(json!({
            "hal_redirection": false,
            "hal_sid": "2",
            "domain": "hal.science",
        }));
        assert_eq!(client.verdict(&mut consultation).await, Verdict::Keep);
        assert_json_include!(
            actual: fields(&consultation),
            expected: json!({
                "hal_endpoint_portail_sid": "1",
                "hal_endpoint_portail": "hal.science",
            })
        );

        // loaded once
        sites.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn test_redirection_from_another_portal_is_kept() {
        let server = MockServer::start_async().await;
        let _sites = mock_sites(&server).await;
        let client = client(&server);

        let mut redirected = record(json!({
            "hal_redirection": true,
            "hal_sid": "2",
            "domain": "hal.science",
        }));

        assert_eq!(client.verdict(&mut redirected).await, Verdict::Keep);
        assert_json_include!(
            actual: fields(&redirected),
            expected: json!({
                "hal_endpoint_portail_sid": "2",
                "hal_endpoint_portail": "https://inria.hal.science/",
                "hal_redirect_portail_sid": "1",
                "hal_redirect_portail": "hal.science",
            })
        );
    }
}
