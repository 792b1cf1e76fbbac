//! Built-in formats
//!
//! Each format is a configured instance of one continuation family. The
//! option structs are what a source entry's `options` block deserializes
//! into; unknown keys are rejected.

use super::{parse_options, FormatInfo};
use crate::decode::FieldPath;
use crate::error::{Error, Result};
use crate::http::HttpRequest;
use crate::pagination::{
    Advance, ExpandPaginator, IndexPaginator, MultiEndpointPaginator, NextRequest,
    OffsetPaginator, PageRecovery, ParamCarry, PaginationStrategy, RecordsAt,
    SearchAfterPaginator, Section, SinglePaginator, StopCondition, StreamingPaginator,
    TokenPaginator, WindowedPaginator,
};
use crate::types::{JsonObject, Method, ResponseFormat};
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};

pub(super) const FORMATS: &[FormatInfo] = &[
    FormatInfo {
        name: "ckan3",
        family: "offset",
        description: "CKAN v3 package_search",
        factory: ckan3,
    },
    FormatInfo {
        name: "dataverse",
        family: "offset",
        description: "Dataverse search API",
        factory: dataverse,
    },
    FormatInfo {
        name: "csw2",
        family: "offset",
        description: "OGC Catalogue Service 2.0.2 GetRecords",
        factory: csw2,
    },
    FormatInfo {
        name: "oai-pmh",
        family: "token",
        description: "OAI-PMH ListRecords with resumption tokens",
        factory: oai_pmh,
    },
    FormatInfo {
        name: "magda",
        family: "token",
        description: "Magda registry records",
        factory: magda,
    },
    FormatInfo {
        name: "elasticsearch-scroll",
        family: "token",
        description: "Elasticsearch scroll API",
        factory: elasticsearch_scroll,
    },
    FormatInfo {
        name: "elasticsearch",
        family: "search-after",
        description: "Elasticsearch _search with from/size and search_after",
        factory: elasticsearch,
    },
    FormatInfo {
        name: "geonode",
        family: "multi-endpoint",
        description: "GeoNode layers and documents",
        factory: geonode,
    },
    FormatInfo {
        name: "arcgis-opendata",
        family: "windowed",
        description: "ArcGIS Hub Open Data v3 datasets",
        factory: arcgis_opendata,
    },
    FormatInfo {
        name: "single-json",
        family: "single",
        description: "One JSON document holding every record",
        factory: single_json,
    },
    FormatInfo {
        name: "single-xml",
        family: "single",
        description: "One XML document holding every record",
        factory: single_xml,
    },
    FormatInfo {
        name: "json-index",
        family: "index",
        description: "JSON array of per-record URLs",
        factory: json_index,
    },
    FormatInfo {
        name: "xml-lines",
        family: "streaming",
        description: "Large XML file split on a resource element",
        factory: xml_lines,
    },
];

pub(super) fn base(api_url: &str) -> &str {
    api_url.trim_end_matches('/')
}

pub(super) fn check_rows(format: &str, rows: u64) -> Result<()> {
    if rows == 0 {
        return Err(Error::invalid_options(format, "rows must be positive"));
    }
    Ok(())
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(set)) => vec![set],
        Some(OneOrMany::Many(sets)) => sets,
    })
}

// ============================================================================
// Offset family
// ============================================================================

/// Options of `ckan3`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CkanOptions {
    pub rows: u64,
    /// Path appended to the API URL instead of `/3/action/package_search`
    pub custom_endpoint: Option<String>,
    /// Keep paging until `result.count` is reached, through empty pages
    pub iterate_until_total: bool,
    /// Throttle on a retryable status as well as on timeouts
    pub throttle_on_invalid_status: bool,
    /// Skip a page that still fails once throttled
    pub skip_on_fail: bool,
}

impl Default for CkanOptions {
    fn default() -> Self {
        Self {
            rows: 1000,
            custom_endpoint: None,
            iterate_until_total: false,
            throttle_on_invalid_status: false,
            skip_on_fail: false,
        }
    }
}

fn ckan3(api_url: &str, options: &Value) -> Result<Box<dyn PaginationStrategy>> {
    let opts: CkanOptions = parse_options("ckan3", options)?;
    check_rows("ckan3", opts.rows)?;

    let endpoint = opts
        .custom_endpoint
        .as_deref()
        .unwrap_or("/3/action/package_search");
    let mut paginator = OffsetPaginator::new(
        HttpRequest::get(format!("{}{endpoint}", base(api_url))),
        "start",
        "rows",
        opts.rows,
        RecordsAt::path("result.results").or("result.result"),
    )
    .recovering(PageRecovery {
        throttle_on_status: opts.throttle_on_invalid_status,
        skip_on_fail: opts.skip_on_fail,
    });
    if opts.iterate_until_total {
        paginator = paginator.stopping(StopCondition::total_count("result.count"));
    }
    Ok(Box::new(paginator))
}

/// Options of `dataverse`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DataverseOptions {
    pub rows: u64,
    #[serde(alias = "API_key")]
    pub api_key: Option<String>,
    /// Send the key as the `key` query parameter instead of a header
    pub key_as_url_param: bool,
    /// Fetch every dataset through this JSON exporter, one request each
    pub use_exporter: Option<String>,
}

impl Default for DataverseOptions {
    fn default() -> Self {
        Self {
            rows: 100,
            api_key: None,
            key_as_url_param: false,
            use_exporter: None,
        }
    }
}

fn with_dataverse_key(request: HttpRequest, opts: &DataverseOptions) -> HttpRequest {
    match &opts.api_key {
        Some(key) if opts.key_as_url_param => request.query("key", key),
        Some(key) => request.header("X-Dataverse-key", key),
        None => request,
    }
}

fn dataverse(api_url: &str, options: &Value) -> Result<Box<dyn PaginationStrategy>> {
    let opts: DataverseOptions = parse_options("dataverse", options)?;
    check_rows("dataverse", opts.rows)?;

    let request = HttpRequest::get(format!("{}/search", base(api_url)))
        .query("q", "*")
        .query("type", "dataset");

    let paginator = OffsetPaginator::new(
        with_dataverse_key(request, &opts),
        "start",
        "per_page",
        opts.rows,
        RecordsAt::path("data.items"),
    )
    .advancing(Advance::ByPageLength);

    match &opts.use_exporter {
        None => Ok(Box::new(paginator)),
        Some(exporter) => {
            let export = HttpRequest::get(format!("{}/datasets/export", base(api_url)))
                .query("exporter", exporter);
            Ok(Box::new(ExpandPaginator::new(
                Box::new(paginator),
                with_dataverse_key(export, &opts),
                "persistentId",
                "global_id",
            )))
        }
    }
}

/// Record schema requested from a CSW endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CswSchema {
    #[default]
    Csw,
    Gmd,
}

impl CswSchema {
    fn type_names(self) -> &'static str {
        match self {
            Self::Csw => "csw:Record",
            Self::Gmd => "gmd:MD_Metadata",
        }
    }

    fn output_schema(self) -> &'static str {
        match self {
            Self::Csw => "http://www.opengis.net/cat/csw/2.0.2",
            Self::Gmd => "http://www.isotc211.org/2005/gmd",
        }
    }

    fn record_element(self) -> &'static str {
        match self {
            Self::Csw => "Record",
            Self::Gmd => "MD_Metadata",
        }
    }
}

/// Options of `csw2`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CswOptions {
    pub rows: u64,
    pub harvest_format: CswSchema,
}

impl Default for CswOptions {
    fn default() -> Self {
        Self {
            rows: 100,
            harvest_format: CswSchema::default(),
        }
    }
}

fn csw2(api_url: &str, options: &Value) -> Result<Box<dyn PaginationStrategy>> {
    let opts: CswOptions = parse_options("csw2", options)?;
    check_rows("csw2", opts.rows)?;
    let schema = opts.harvest_format;

    let request = HttpRequest::get(api_url)
        .format(ResponseFormat::Xml)
        .query("request", "GetRecords")
        .query("version", "2.0.2")
        .query("service", "CSW")
        .query("elementSetName", "full")
        .query("resultType", "results")
        .query("typeNames", schema.type_names())
        .query("outputSchema", schema.output_schema());

    let records = FieldPath::from_segments([
        "GetRecordsResponse",
        "SearchResults",
        schema.record_element(),
    ]);
    let paginator = OffsetPaginator::new(
        request,
        "startPosition",
        "maxRecords",
        opts.rows,
        RecordsAt::path(records).optional(),
    )
    .starting_at(1)
    .stopping(StopCondition::total_count(
        "GetRecordsResponse.SearchResults.@numberOfRecordsMatched",
    ));
    Ok(Box::new(paginator))
}

// ============================================================================
// Token family
// ============================================================================

/// Options of `oai-pmh`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OaiPmhOptions {
    pub metadata_prefix: String,
    /// One set, or several harvested one after the other
    #[serde(alias = "set", deserialize_with = "one_or_many")]
    pub collection_set: Vec<String>,
    /// Resend every parameter alongside the resumption token
    pub preserve_params: bool,
}

impl Default for OaiPmhOptions {
    fn default() -> Self {
        Self {
            metadata_prefix: "oai_dc".to_string(),
            collection_set: Vec::new(),
            preserve_params: false,
        }
    }
}

fn oai_set(api_url: &str, opts: &OaiPmhOptions, set: Option<&str>) -> TokenPaginator {
    let mut request = HttpRequest::get(api_url)
        .format(ResponseFormat::Xml)
        .query("verb", "ListRecords")
        .query("metadataPrefix", &opts.metadata_prefix);
    if let Some(set) = set {
        request = request.query("set", set);
    }

    let carry = if opts.preserve_params {
        ParamCarry::All
    } else {
        ParamCarry::Only(vec!["verb".to_string()])
    };

    TokenPaginator::new(
        request,
        RecordsAt::path("OAI-PMH.ListRecords.record")
            .optional()
            .within("OAI-PMH.ListRecords"),
        "OAI-PMH.ListRecords.resumptionToken",
        NextRequest::Query {
            param: "resumptionToken".to_string(),
            carry,
        },
    )
    .or_token("OAI-PMH.resumptionToken")
    .with_sentinel("0")
}

fn oai_pmh(api_url: &str, options: &Value) -> Result<Box<dyn PaginationStrategy>> {
    let opts: OaiPmhOptions = parse_options("oai-pmh", options)?;

    match opts.collection_set.as_slice() {
        [] => Ok(Box::new(oai_set(api_url, &opts, None))),
        [set] => Ok(Box::new(oai_set(api_url, &opts, Some(set)))),
        sets => {
            let sections = sets
                .iter()
                .map(|set| {
                    Section::labelled(set.clone(), Box::new(oai_set(api_url, &opts, Some(set))))
                })
                .collect();
            Ok(Box::new(MultiEndpointPaginator::new(sections).soft_fail(true)))
        }
    }
}

/// Options of `magda`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MagdaOptions {
    pub rows: u64,
}

impl Default for MagdaOptions {
    fn default() -> Self {
        Self { rows: 1000 }
    }
}

fn magda(api_url: &str, options: &Value) -> Result<Box<dyn PaginationStrategy>> {
    let opts: MagdaOptions = parse_options("magda", options)?;
    check_rows("magda", opts.rows)?;

    let request = HttpRequest::get(format!("{}/v0/registry/records", base(api_url)))
        .query("aspect", "dcat-dataset-strings")
        .query("limit", opts.rows.to_string())
        .query("optionalAspect", "dataset-publisher");
    let paginator = TokenPaginator::new(
        request,
        RecordsAt::path("records"),
        "nextPageToken",
        NextRequest::query("pageToken"),
    )
    .with_has_more("hasMore");
    Ok(Box::new(paginator))
}

/// Options of `elasticsearch-scroll`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScrollOptions {
    pub rows: usize,
    /// Endpoint receiving `{scroll, scroll_id}` bodies
    pub scroll_url: Option<String>,
    /// Keep-alive of the search context (e.g. "15s")
    pub scroll: String,
    /// Send continuation bodies with GET instead of POST
    pub scroll_using_get: bool,
}

impl Default for ScrollOptions {
    fn default() -> Self {
        Self {
            rows: 1000,
            scroll_url: None,
            scroll: "15s".to_string(),
            scroll_using_get: false,
        }
    }
}

fn elasticsearch_scroll(api_url: &str, options: &Value) -> Result<Box<dyn PaginationStrategy>> {
    let opts: ScrollOptions = parse_options("elasticsearch-scroll", options)?;
    check_rows("elasticsearch-scroll", opts.rows as u64)?;
    let scroll_url = opts
        .scroll_url
        .ok_or_else(|| Error::invalid_options("elasticsearch-scroll", "scroll_url is required"))?;

    let mut template = JsonObject::new();
    template.insert("scroll".into(), json!(opts.scroll));
    let method = if opts.scroll_using_get {
        Method::GET
    } else {
        Method::POST
    };

    let request = HttpRequest::get(api_url)
        .query("size", opts.rows.to_string())
        .query("scroll", &opts.scroll);
    let paginator = TokenPaginator::new(
        request,
        RecordsAt::path("hits.hits"),
        "_scroll_id",
        NextRequest::Body {
            url: scroll_url,
            method,
            template,
            field: "scroll_id".to_string(),
        },
    )
    .with_page_size(opts.rows)
    .with_total("hits.total");
    Ok(Box::new(paginator))
}

// ============================================================================
// Search-after family
// ============================================================================

/// Options of `elasticsearch`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ElasticsearchOptions {
    pub rows: usize,
    /// Unique field with doc values, enables paging past the result window
    pub search_after_field: Option<String>,
    /// Query body; `match_all` when absent
    pub query: Option<JsonObject>,
}

impl Default for ElasticsearchOptions {
    fn default() -> Self {
        Self {
            rows: 1000,
            search_after_field: None,
            query: None,
        }
    }
}

fn elasticsearch(api_url: &str, options: &Value) -> Result<Box<dyn PaginationStrategy>> {
    let opts: ElasticsearchOptions = parse_options("elasticsearch", options)?;
    check_rows("elasticsearch", opts.rows as u64)?;
    Ok(Box::new(SearchAfterPaginator::new(
        api_url,
        opts.query,
        opts.rows,
        opts.search_after_field,
    )))
}

// ============================================================================
// Multi-endpoint and windowed
// ============================================================================

/// Options of `geonode`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GeonodeOptions {
    pub rows: u64,
    pub get_layers: bool,
    pub get_documents: bool,
}

impl Default for GeonodeOptions {
    fn default() -> Self {
        Self {
            rows: 100,
            get_layers: true,
            get_documents: true,
        }
    }
}

fn geonode(api_url: &str, options: &Value) -> Result<Box<dyn PaginationStrategy>> {
    let opts: GeonodeOptions = parse_options("geonode", options)?;
    check_rows("geonode", opts.rows)?;

    let root = base(api_url);
    let endpoints = [
        (opts.get_layers, "/api/layers/", "Dataset:Geographic"),
        (opts.get_documents, "/api/documents/", "Document"),
    ];
    let sections: Vec<Section> = endpoints
        .into_iter()
        .filter(|(enabled, _, _)| *enabled)
        .map(|(_, endpoint, label)| {
            let request =
                HttpRequest::get(format!("{root}{endpoint}")).query("limit", opts.rows.to_string());
            let paginator = TokenPaginator::new(
                request,
                RecordsAt::path("objects"),
                "meta.next",
                NextRequest::url(Some(root.to_string())),
            );
            Section::labelled(label, Box::new(paginator))
        })
        .collect();

    if sections.is_empty() {
        return Err(Error::invalid_options(
            "geonode",
            "at least one of get_layers and get_documents must be enabled",
        ));
    }
    Ok(Box::new(MultiEndpointPaginator::new(sections).tagged("type")))
}

/// Options of `arcgis-opendata`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ArcgisOptions {
    pub rows: usize,
}

impl Default for ArcgisOptions {
    fn default() -> Self {
        Self { rows: 99 }
    }
}

fn arcgis_opendata(api_url: &str, options: &Value) -> Result<Box<dyn PaginationStrategy>> {
    let opts: ArcgisOptions = parse_options("arcgis-opendata", options)?;
    check_rows("arcgis-opendata", opts.rows as u64)?;
    if opts.rows >= 100 {
        return Err(Error::invalid_options(
            "arcgis-opendata",
            "the v3 API only supports rows < 100",
        ));
    }

    let request = HttpRequest::get(format!("{}/v3/datasets", base(api_url)))
        .query("sort", "-modified")
        .query("filter[openData]", "true")
        .query(
            "fields[datasets]",
            "access,categories,collection,created,description,extent,license,licenseInfo,\
             modified,name,organization,slug,structuredLicense,tags,type,typeCategories",
        )
        .query("page[size]", opts.rows.to_string());
    Ok(Box::new(WindowedPaginator::new(
        request,
        "page[number]",
        "filter[modified]",
        opts.rows,
        RecordsAt::path("data"),
    )))
}

// ============================================================================
// Single, index and streaming
// ============================================================================

/// Options of `single-json` and `single-xml`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SingleOptions {
    /// Location of the record array; the document itself when absent
    pub result_key: Option<FieldPath>,
}

fn single_json(api_url: &str, options: &Value) -> Result<Box<dyn PaginationStrategy>> {
    let opts: SingleOptions = parse_options("single-json", options)?;
    Ok(Box::new(SinglePaginator::new(
        HttpRequest::get(api_url),
        opts.result_key,
    )))
}

fn single_xml(api_url: &str, options: &Value) -> Result<Box<dyn PaginationStrategy>> {
    let opts: SingleOptions = parse_options("single-xml", options)?;
    Ok(Box::new(SinglePaginator::new(
        HttpRequest::get(api_url).format(ResponseFormat::Xml),
        opts.result_key,
    )))
}

/// Options of `json-index`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IndexOptions {
    /// Location of the URL inside object items
    pub url_location: Option<FieldPath>,
}

fn json_index(api_url: &str, options: &Value) -> Result<Box<dyn PaginationStrategy>> {
    let opts: IndexOptions = parse_options("json-index", options)?;
    Ok(Box::new(IndexPaginator::new(
        HttpRequest::get(api_url),
        opts.url_location,
    )))
}

/// Options of `xml-lines`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct XmlLinesOptions {
    /// Element wrapping one record, e.g. `dcat:Dataset`
    pub resource_element: String,
}

fn xml_lines(api_url: &str, options: &Value) -> Result<Box<dyn PaginationStrategy>> {
    let opts: XmlLinesOptions = parse_options("xml-lines", options)?;
    if opts.resource_element.trim().is_empty() {
        return Err(Error::invalid_options(
            "xml-lines",
            "resource_element is required",
        ));
    }
    Ok(Box::new(StreamingPaginator::new(
        api_url,
        opts.resource_element,
    )))
}
