//! Thin client for one MediaWiki `api.php` endpoint.
//!
//! Three request shapes (`query`, `parse`, `opensearch`), JSON in/out, with
//! per-site header/proxy overrides folded in at client construction. Wire
//! structs tolerate both formatversion=2 and the legacy response shapes
//! older wikis still emit (object-keyed `pages`, empty-string flags).

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::time::Duration;
use url::Url;
use wikilink_core::{Error, Result, SiteRule};

use crate::titles;

const DEFAULT_USER_AGENT: &str = "wikilink-mw/0.1";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Fold every matching rule in declaration order, so later entries override
/// earlier ones per header key (and the last proxy wins). This is the
/// documented tie-break: lower entries in the configured list have priority.
pub fn merged_overrides(api: &str, rules: &[SiteRule]) -> (BTreeMap<String, String>, Option<String>) {
    let mut headers = BTreeMap::new();
    let mut proxy = None;
    for rule in rules {
        if !rule.matches(api) {
            continue;
        }
        for (k, v) in &rule.headers {
            headers.insert(k.clone(), v.clone());
        }
        if rule.proxy.is_some() {
            proxy = rule.proxy.clone();
        }
    }
    (headers, proxy)
}

#[derive(Debug, Clone)]
pub struct ApiGateway {
    client: reqwest::Client,
    api: Url,
}

impl ApiGateway {
    pub fn new(api: &str, rules: &[SiteRule]) -> Result<Self> {
        if !titles::is_valid_api(api) {
            return Err(Error::InvalidApi(api.trim().to_string()));
        }
        let api_url = Url::parse(api.trim()).map_err(|e| Error::InvalidApi(e.to_string()))?;

        let (headers, proxy) = merged_overrides(api, rules);
        let mut builder = reqwest::Client::builder()
            .user_agent(DEFAULT_USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(10))
            // Avoid "hang forever" on DNS/TLS/body stalls; per-request
            // timeouts below are tighter anyway.
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30));

        if !headers.is_empty() {
            let mut hdrs = reqwest::header::HeaderMap::new();
            for (k, v) in &headers {
                if let (Ok(name), Ok(value)) = (
                    reqwest::header::HeaderName::from_bytes(k.as_bytes()),
                    reqwest::header::HeaderValue::from_str(v),
                ) {
                    hdrs.insert(name, value);
                }
            }
            builder = builder.default_headers(hdrs);
        }
        if let Some(p) = proxy {
            let proxy = reqwest::Proxy::all(&p).map_err(|e| Error::InvalidApi(e.to_string()))?;
            builder = builder.proxy(proxy);
        }

        let client = builder.build().map_err(|e| Error::Query(e.to_string()))?;
        Ok(Self {
            client,
            api: api_url,
        })
    }

    pub fn api(&self) -> &str {
        self.api.as_str()
    }

    async fn get<T: DeserializeOwned>(&self, params: &[(&str, &str)]) -> Result<T> {
        let resp = self
            .client
            .get(self.api.clone())
            .query(params)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| Error::Query(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Query(format!("HTTP {status}")));
        }
        resp.json::<T>().await.map_err(|e| Error::Query(e.to_string()))
    }

    async fn post_form<T: DeserializeOwned>(&self, params: &[(&str, &str)]) -> Result<T> {
        let resp = self
            .client
            .post(self.api.clone())
            .form(params)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| Error::Query(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Query(format!("HTTP {status}")));
        }
        resp.json::<T>().await.map_err(|e| Error::Query(e.to_string()))
    }

    /// Page info + extracts + site meta for up to 5 titles in one request.
    pub async fn query_pages(&self, titles: &[String]) -> Result<QueryPayload> {
        let joined = titles.join("|");
        let params = [
            ("action", "query"),
            ("format", "json"),
            ("formatversion", "2"),
            ("prop", "info|extracts"),
            ("meta", "siteinfo"),
            ("siprop", "specialpagealiases|namespaces"),
            ("iwurl", "1"),
            ("redirects", "1"),
            ("converttitles", "1"),
            ("inprop", "url|displaytitle"),
            ("exchars", "150"),
            ("exlimit", "max"),
            ("explaintext", "1"),
            ("titles", joined.as_str()),
        ];
        let env: ApiEnvelope = self.get(&params).await?;
        if let Some(err) = env.error {
            return Err(Error::Query(err.message()));
        }
        env.query
            .ok_or_else(|| Error::Query("response missing query payload".to_string()))
    }

    /// Render a stored page to HTML, wrapped in `mw-parser-output`, with the
    /// limit report, edit sections, and TOC disabled.
    pub async fn parse_page(&self, pageid: u64) -> Result<ParsePayload> {
        let pageid_s = pageid.to_string();
        let params = [
            ("action", "parse"),
            ("format", "json"),
            ("formatversion", "2"),
            ("pageid", pageid_s.as_str()),
            ("prop", "text|wikitext"),
            ("wrapoutputclass", "mw-parser-output"),
            ("disablelimitreport", "1"),
            ("disableeditsection", "1"),
            ("disabletoc", "1"),
        ];
        let env: ApiEnvelope = self.get(&params).await?;
        if let Some(err) = env.error {
            return Err(Error::Query(err.message()));
        }
        env.parse
            .ok_or_else(|| Error::Query("response missing parse payload".to_string()))
    }

    /// Render raw wikitext (pre-save transformed, preview mode).
    pub async fn parse_wikitext(&self, text: &str, title: Option<&str>) -> Result<ParsePayload> {
        let mut params = vec![
            ("action", "parse"),
            ("format", "json"),
            ("formatversion", "2"),
            ("text", text),
            ("prop", "text"),
            ("pst", "1"),
            ("preview", "1"),
            ("disableeditsection", "1"),
        ];
        if let Some(t) = title {
            params.push(("title", t));
        }
        let env: ApiEnvelope = self.post_form(&params).await?;
        if let Some(err) = env.error {
            return Err(Error::Query(err.message()));
        }
        env.parse
            .ok_or_else(|| Error::Query("response missing parse payload".to_string()))
    }

    /// Keyword search via the legacy opensearch 4-tuple.
    pub async fn opensearch(&self, keyword: &str, limit: usize) -> Result<OpenSearch> {
        let limit_s = limit.to_string();
        let params = [
            ("action", "opensearch"),
            ("format", "json"),
            ("search", keyword),
            ("redirects", "resolve"),
            ("limit", limit_s.as_str()),
        ];
        let (keyword, titles, summaries, urls): (String, Vec<String>, Vec<String>, Vec<String>) =
            self.get(&params).await?;
        Ok(OpenSearch {
            keyword,
            titles,
            summaries,
            urls,
        })
    }
}

#[derive(Debug, Clone)]
pub struct OpenSearch {
    pub keyword: String,
    pub titles: Vec<String>,
    pub summaries: Vec<String>,
    pub urls: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope {
    #[serde(default)]
    query: Option<QueryPayload>,
    #[serde(default)]
    parse: Option<ParsePayload>,
    #[serde(default)]
    error: Option<ApiErrorBody>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    info: Option<String>,
}

impl ApiErrorBody {
    fn message(&self) -> String {
        match (&self.code, &self.info) {
            (Some(c), Some(i)) => format!("{c}: {i}"),
            (Some(c), None) => c.clone(),
            (None, Some(i)) => i.clone(),
            (None, None) => "unknown api error".to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct QueryPayload {
    #[serde(default, deserialize_with = "de_pages")]
    pub pages: Vec<PageInfo>,
    #[serde(default)]
    pub redirects: Vec<RedirectInfo>,
    #[serde(default)]
    pub normalized: Vec<NormalizedInfo>,
    #[serde(default)]
    pub interwiki: Vec<InterwikiInfo>,
    #[serde(default)]
    pub specialpagealiases: Vec<SpecialPageAlias>,
    #[serde(default, deserialize_with = "de_namespaces")]
    pub namespaces: BTreeMap<i64, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageInfo {
    #[serde(default)]
    pub pageid: Option<u64>,
    #[serde(default)]
    pub ns: Option<i64>,
    #[serde(default)]
    pub title: String,
    #[serde(default, deserialize_with = "de_flag")]
    pub missing: bool,
    #[serde(default, deserialize_with = "de_flag")]
    pub invalid: bool,
    #[serde(default)]
    pub invalidreason: Option<String>,
    #[serde(default, deserialize_with = "de_flag")]
    pub special: bool,
    #[serde(default)]
    pub fullurl: Option<String>,
    #[serde(default)]
    pub editurl: Option<String>,
    #[serde(default)]
    pub canonicalurl: Option<String>,
    #[serde(default)]
    pub extract: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RedirectInfo {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub tofragment: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NormalizedInfo {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InterwikiInfo {
    #[serde(default)]
    pub title: Option<String>,
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpecialPageAlias {
    pub realname: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ParsePayload {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "de_text")]
    pub text: Option<String>,
}

/// formatversion=2 sends `pages` as an array; legacy responses key an object
/// by pageid. Accept both.
fn de_pages<'de, D>(d: D) -> std::result::Result<Vec<PageInfo>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Pages {
        List(Vec<PageInfo>),
        Map(BTreeMap<String, PageInfo>),
    }
    Ok(match Option::<Pages>::deserialize(d)? {
        None => Vec::new(),
        Some(Pages::List(v)) => v,
        Some(Pages::Map(m)) => m.into_values().collect(),
    })
}

/// formatversion=2 flags are real booleans; legacy responses mark presence
/// with an empty string. Either way, presence means true.
fn de_flag<'de, D>(d: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Marker(String),
    }
    Ok(match Option::<Flag>::deserialize(d)? {
        None => false,
        Some(Flag::Bool(b)) => b,
        Some(Flag::Marker(_)) => true,
    })
}

/// `parse.text` is a string under formatversion=2 and `{"*": "…"}` before it.
fn de_text<'de, D>(d: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Text {
        Plain(String),
        Starred {
            #[serde(rename = "*")]
            star: String,
        },
    }
    Ok(Option::<Text>::deserialize(d)?.map(|t| match t {
        Text::Plain(s) => s,
        Text::Starred { star } => star,
    }))
}

/// Namespace table entries carry `name` under formatversion=2 and `*`
/// before it; keys are stringified ids.
fn de_namespaces<'de, D>(d: D) -> std::result::Result<BTreeMap<i64, String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct NsEntry {
        #[serde(default)]
        id: Option<i64>,
        #[serde(default)]
        name: Option<String>,
        #[serde(default, rename = "*")]
        star: Option<String>,
    }
    let raw = Option::<BTreeMap<String, NsEntry>>::deserialize(d)?.unwrap_or_default();
    let mut out = BTreeMap::new();
    for (key, entry) in raw {
        let Some(id) = entry.id.or_else(|| key.parse::<i64>().ok()) else {
            continue;
        };
        if let Some(name) = entry.name.or(entry.star) {
            out.insert(id, name);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_formatversion2_query_shape() {
        let js = r#"
        {
          "query": {
            "pages": [
              {"pageid": 1, "ns": 0, "title": "Main Page",
               "canonicalurl": "https://wiki.example/Main_Page",
               "editurl": "https://wiki.example/index.php?title=Main_Page&action=edit",
               "extract": "Hello"}
            ],
            "redirects": [{"from": "MP", "to": "Main Page"}],
            "namespaces": {"-1": {"id": -1, "name": "Special"}, "0": {"id": 0, "name": ""}},
            "specialpagealiases": [{"realname": "Mypage", "aliases": ["Mypage", "我的用户页"]}]
          }
        }
        "#;
        let env: ApiEnvelope = serde_json::from_str(js).unwrap();
        let q = env.query.unwrap();
        assert_eq!(q.pages.len(), 1);
        assert_eq!(q.pages[0].pageid, Some(1));
        assert!(!q.pages[0].missing);
        assert_eq!(q.redirects[0].to, "Main Page");
        assert_eq!(q.namespaces.get(&-1).map(String::as_str), Some("Special"));
        assert_eq!(q.specialpagealiases[0].aliases.len(), 2);
    }

    #[test]
    fn parses_legacy_object_keyed_pages_and_marker_flags() {
        let js = r#"
        {
          "query": {
            "pages": {
              "-1": {"ns": 0, "title": "Nope", "missing": ""},
              "7": {"pageid": 7, "ns": 0, "title": "Yep"}
            },
            "namespaces": {"-1": {"id": -1, "*": "特殊"}}
          }
        }
        "#;
        let env: ApiEnvelope = serde_json::from_str(js).unwrap();
        let q = env.query.unwrap();
        assert_eq!(q.pages.len(), 2);
        let nope = q.pages.iter().find(|p| p.title == "Nope").unwrap();
        assert!(nope.missing);
        assert!(!nope.invalid);
        assert_eq!(q.namespaces.get(&-1).map(String::as_str), Some("特殊"));
    }

    #[test]
    fn parses_both_parse_text_shapes() {
        let v2: ApiEnvelope =
            serde_json::from_str(r#"{"parse": {"title": "T", "text": "<p>hi</p>"}}"#).unwrap();
        assert_eq!(v2.parse.unwrap().text.as_deref(), Some("<p>hi</p>"));

        let v1: ApiEnvelope =
            serde_json::from_str(r#"{"parse": {"title": "T", "text": {"*": "<p>hi</p>"}}}"#)
                .unwrap();
        assert_eq!(v1.parse.unwrap().text.as_deref(), Some("<p>hi</p>"));
    }

    #[test]
    fn surfaces_api_error_body() {
        let env: ApiEnvelope = serde_json::from_str(
            r#"{"error": {"code": "badtitle", "info": "Bad title"}}"#,
        )
        .unwrap();
        assert_eq!(env.error.unwrap().message(), "badtitle: Bad title");
    }

    #[test]
    fn overrides_fold_in_order_and_later_rules_win() {
        let mut a = SiteRule {
            host: "huijiwiki.com".to_string(),
            ..Default::default()
        };
        a.headers
            .insert("user-agent".to_string(), "general".to_string());
        a.headers.insert("accept-language".to_string(), "zh".to_string());
        a.proxy = Some("socks5://general:1080".to_string());

        let mut b = SiteRule {
            host: "warframe.huijiwiki.com".to_string(),
            ..Default::default()
        };
        b.headers
            .insert("user-agent".to_string(), "specific".to_string());

        let api = "https://warframe.huijiwiki.com/api.php";
        let (headers, proxy) = merged_overrides(api, &[a, b]);
        assert_eq!(headers.get("user-agent").map(String::as_str), Some("specific"));
        assert_eq!(headers.get("accept-language").map(String::as_str), Some("zh"));
        assert_eq!(proxy.as_deref(), Some("socks5://general:1080"));
    }

    #[test]
    fn gateway_rejects_non_api_endpoints() {
        assert!(matches!(
            ApiGateway::new("https://wiki.example/index.php", &[]),
            Err(Error::InvalidApi(_))
        ));
        assert!(ApiGateway::new("https://wiki.example/w/api.php", &[]).is_ok());
    }

    #[tokio::test]
    async fn query_pages_round_trips_against_fixture() {
        use axum::{extract::Query, http::header, routing::get, Router};

        async fn api(Query(params): Query<BTreeMap<String, String>>) -> impl axum::response::IntoResponse {
            assert_eq!(params.get("action").map(String::as_str), Some("query"));
            assert_eq!(params.get("titles").map(String::as_str), Some("Main Page"));
            (
                [(header::CONTENT_TYPE, "application/json")],
                r#"{"query":{"pages":[{"pageid":1,"ns":0,"title":"Main Page","canonicalurl":"https://wiki.example/Main_Page"}],"namespaces":{"-1":{"id":-1,"name":"Special"}}}}"#,
            )
        }

        let app = Router::new().route("/api.php", get(api));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let gw = ApiGateway::new(&format!("http://{addr}/api.php"), &[]).unwrap();
        let q = gw.query_pages(&["Main Page".to_string()]).await.unwrap();
        assert_eq!(q.pages[0].title, "Main Page");
    }

    #[tokio::test]
    async fn non_success_status_maps_to_query_error() {
        use axum::{http::StatusCode, routing::get, Router};

        let app = Router::new().route(
            "/api.php",
            get(|| async { (StatusCode::BAD_GATEWAY, "upstream sad") }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let gw = ApiGateway::new(&format!("http://{addr}/api.php"), &[]).unwrap();
        let err = gw.query_pages(&["X".to_string()]).await.unwrap_err();
        assert!(matches!(err, Error::Query(_)), "got {err:?}");
    }

    #[test]
    fn opensearch_tuple_shape_parses() {
        let js = r#"["mai", ["Main Page", "Maize"], ["", ""], ["https://w/Main_Page", "https://w/Maize"]]"#;
        let parsed: (String, Vec<String>, Vec<String>, Vec<String>) =
            serde_json::from_str(js).unwrap();
        assert_eq!(parsed.0, "mai");
        assert_eq!(parsed.1.len(), 2);
    }
}
