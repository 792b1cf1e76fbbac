//! Portal formats
//!
//! Catalogue APIs of individual portal products. Most of them page with
//! offsets or page numbers and differ only in parameter names, record
//! locations and defaults.

use super::builtin::{base, check_rows};
use super::{parse_options, FormatInfo};
use crate::error::{Error, Result};
use crate::http::HttpRequest;
use crate::pagination::{
    Advance, IndexPaginator, MultiEndpointPaginator, NextRequest, OffsetPaginator, PageLimit,
    PaginationStrategy, ParamCarry, RecordsAt, Section, StopCondition, TokenPaginator,
    WindowBoundary, WindowedPaginator, RESULT_WINDOW,
};
use crate::types::ResponseFormat;
use serde::Deserialize;
use serde_json::Value;

pub(super) const PORTAL_FORMATS: &[FormatInfo] = &[
    FormatInfo {
        name: "dkan",
        family: "offset",
        description: "DKAN current_package_list_with_resources",
        factory: dkan,
    },
    FormatInfo {
        name: "dataone",
        family: "offset",
        description: "DataONE Solr query endpoint",
        factory: dataone,
    },
    FormatInfo {
        name: "opendatasoft",
        family: "offset",
        description: "OpenDataSoft datasets search v1",
        factory: opendatasoft,
    },
    FormatInfo {
        name: "blacklight",
        family: "offset",
        description: "Blacklight catalog JSON",
        factory: blacklight,
    },
    FormatInfo {
        name: "datagov-in",
        family: "offset",
        description: "data.gov.in catalog",
        factory: datagov_in,
    },
    FormatInfo {
        name: "sciencebase",
        family: "offset",
        description: "ScienceBase catalog items",
        factory: sciencebase,
    },
    FormatInfo {
        name: "geoplatform",
        family: "offset",
        description: "GeoPlatform search",
        factory: geoplatform,
    },
    FormatInfo {
        name: "geonetwork",
        family: "offset",
        description: "GeoNetwork q search",
        factory: geonetwork,
    },
    FormatInfo {
        name: "udata",
        family: "offset",
        description: "udata datasets API v1",
        factory: udata,
    },
    FormatInfo {
        name: "socrata",
        family: "token",
        description: "Socrata Discovery API catalog",
        factory: socrata,
    },
    FormatInfo {
        name: "eudp",
        family: "token",
        description: "European Data Portal search with scrolling",
        factory: eudp,
    },
    FormatInfo {
        name: "invenio",
        family: "windowed",
        description: "Invenio records API",
        factory: invenio,
    },
    FormatInfo {
        name: "junar",
        family: "multi-endpoint",
        description: "Junar API v2 resources",
        factory: junar,
    },
    FormatInfo {
        name: "knoema",
        family: "index",
        description: "Knoema DCAT catalog, one request per dataset",
        factory: knoema,
    },
];

/// Options of the portal formats that only take a page size
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PortalOptions {
    /// Records per page; each format has its own default
    pub rows: Option<u64>,
}

fn rows(format: &str, options: &Value, default: u64) -> Result<u64> {
    let opts: PortalOptions = parse_options(format, options)?;
    let rows = opts.rows.unwrap_or(default);
    check_rows(format, rows)?;
    Ok(rows)
}

// ============================================================================
// Offset family
// ============================================================================

fn dkan(api_url: &str, options: &Value) -> Result<Box<dyn PaginationStrategy>> {
    let rows = rows("dkan", options, 10)?;
    let request = HttpRequest::get(format!(
        "{}/3/action/current_package_list_with_resources",
        base(api_url)
    ));
    let paginator = OffsetPaginator::new(
        request,
        "offset",
        "limit",
        rows,
        RecordsAt::path("result.result").or("result"),
    )
    .advancing(Advance::ByPageLength);
    Ok(Box::new(paginator))
}

fn dataone(api_url: &str, options: &Value) -> Result<Box<dyn PaginationStrategy>> {
    let rows = rows("dataone", options, 2000)?;
    let request = HttpRequest::get(format!("{}/v2/query/solr/", base(api_url)))
        .query("q", " -obsoletedBy:* AND formatType:METADATA")
        .query("wt", "json");
    let paginator = OffsetPaginator::new(
        request,
        "start",
        "rows",
        rows,
        RecordsAt::path("response.docs"),
    )
    .advancing(Advance::ByPageLength);
    Ok(Box::new(paginator))
}

fn opendatasoft(api_url: &str, options: &Value) -> Result<Box<dyn PaginationStrategy>> {
    let rows = rows("opendatasoft", options, 1000)?;
    let paginator = OffsetPaginator::new(
        HttpRequest::get(format!("{}/datasets/1.0/search/", base(api_url))),
        "start",
        "rows",
        rows,
        RecordsAt::path("datasets"),
    )
    .advancing(Advance::ByPageLength);
    Ok(Box::new(paginator))
}

fn blacklight(api_url: &str, options: &Value) -> Result<Box<dyn PaginationStrategy>> {
    let rows = rows("blacklight", options, 100)?;
    let paginator = OffsetPaginator::new(
        HttpRequest::get(api_url).header("Accept", "application/json"),
        "page",
        "per_page",
        rows,
        RecordsAt::path("response.docs"),
    )
    .starting_at(1)
    .advancing(Advance::ByPage)
    .with_total("response.pages.total_count");
    Ok(Box::new(paginator))
}

fn datagov_in(api_url: &str, options: &Value) -> Result<Box<dyn PaginationStrategy>> {
    let rows = rows("datagov-in", options, 1000)?;
    let paginator = OffsetPaginator::new(
        HttpRequest::get(api_url).query("format", "json"),
        "offset",
        "limit",
        rows,
        RecordsAt::path("records"),
    )
    .advancing(Advance::ByPageLength)
    .with_total("total");
    Ok(Box::new(paginator))
}

fn sciencebase(api_url: &str, options: &Value) -> Result<Box<dyn PaginationStrategy>> {
    let rows = rows("sciencebase", options, 500)?;
    let paginator = OffsetPaginator::new(
        HttpRequest::get(api_url),
        "offset",
        "max",
        rows,
        RecordsAt::path("items"),
    )
    .advancing(Advance::ByPageLength)
    .with_total("total");
    Ok(Box::new(paginator))
}

fn geoplatform(api_url: &str, options: &Value) -> Result<Box<dyn PaginationStrategy>> {
    let rows = rows("geoplatform", options, 1000)?;
    let paginator = OffsetPaginator::new(
        HttpRequest::get(api_url),
        "page",
        "size",
        rows,
        RecordsAt::path("results"),
    )
    .advancing(Advance::ByPage)
    .with_total("totalResults");
    Ok(Box::new(paginator))
}

fn geonetwork(api_url: &str, options: &Value) -> Result<Box<dyn PaginationStrategy>> {
    let rows = rows("geonetwork", options, 100)?;
    let request = HttpRequest::get(api_url)
        .query("_content_type", "json")
        .query("buildSummary", "false")
        .query("fast", "index")
        .query("sortBy", "changeDate");
    let paginator = OffsetPaginator::new(request, "from", "to", rows, RecordsAt::path("metadata"))
        .starting_at(1)
        .limited_by(PageLimit::LastIndex)
        .stopping(StopCondition::ShortPage);
    Ok(Box::new(paginator))
}

fn udata(api_url: &str, options: &Value) -> Result<Box<dyn PaginationStrategy>> {
    let rows = rows("udata", options, 500)?;
    let paginator = OffsetPaginator::new(
        HttpRequest::get(format!("{}/1/datasets/", base(api_url))),
        "page",
        "page_size",
        rows,
        RecordsAt::path("data"),
    )
    .starting_at(1)
    .advancing(Advance::ByPage)
    .stopping(StopCondition::ShortPage)
    .with_total("total");
    Ok(Box::new(paginator))
}

// ============================================================================
// Token family
// ============================================================================

fn socrata(api_url: &str, options: &Value) -> Result<Box<dyn PaginationStrategy>> {
    let rows = rows("socrata", options, 10_000)?;
    let request = HttpRequest::get(format!("{}/catalog/v1", base(api_url)))
        .query("limit", rows.to_string())
        .query("order", "dataset_id");
    let paginator = TokenPaginator::keyed_on_last_record(
        request,
        RecordsAt::path("results"),
        "resource.id",
        NextRequest::Query {
            param: "scroll_id".to_string(),
            carry: ParamCarry::Only(vec!["limit".to_string()]),
        },
    );
    Ok(Box::new(paginator))
}

fn eudp(api_url: &str, options: &Value) -> Result<Box<dyn PaginationStrategy>> {
    let rows = rows("eudp", options, 1000)?;
    let root = base(api_url);
    let request = HttpRequest::get(format!("{root}/search"))
        .query("filter", "dataset")
        .query("aggregation", "false")
        .query("limit", rows.to_string())
        .query("scroll", "true");
    let paginator = TokenPaginator::new(
        request,
        RecordsAt::path("result.results"),
        "result.scrollId",
        NextRequest::Endpoint {
            url: format!("{root}/scroll"),
            param: "scrollId".to_string(),
        },
    )
    .with_total("result.count");
    Ok(Box::new(paginator))
}

// ============================================================================
// Windowed, multi-endpoint and index
// ============================================================================

fn invenio(api_url: &str, options: &Value) -> Result<Box<dyn PaginationStrategy>> {
    let rows = rows("invenio", options, 1000)?;
    let request = HttpRequest::get(api_url)
        .query("size", rows.to_string())
        .query("facets", "")
        .query("sort", "mostrecent");
    let page_size = rows as usize;
    // the last page of a window ends exactly on the result window
    let paginator = WindowedPaginator::new(request, "page", "q", page_size, RecordsAt::path("hits.hits"))
        .with_window(RESULT_WINDOW + page_size)
        .with_fields("id", "created")
        .bounded_by(WindowBoundary::UpTo {
            field: "created".to_string(),
        })
        .ending_on_short_page();
    Ok(Box::new(paginator))
}

const JUNAR_RESOURCES: &[&str] = &["datasets", "datastreams", "visualizations", "dashboards"];

/// Options of `junar`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JunarOptions {
    pub rows: u64,
    /// Resource types harvested one after the other
    pub resource_types: Vec<String>,
    /// Sent as the `auth_key` parameter
    #[serde(alias = "API_key")]
    pub api_key: Option<String>,
}

impl Default for JunarOptions {
    fn default() -> Self {
        Self {
            rows: 1000,
            resource_types: Vec::new(),
            api_key: None,
        }
    }
}

fn junar(api_url: &str, options: &Value) -> Result<Box<dyn PaginationStrategy>> {
    let opts: JunarOptions = parse_options("junar", options)?;
    check_rows("junar", opts.rows)?;
    if opts.resource_types.is_empty() {
        return Err(Error::invalid_options("junar", "resource_types is required"));
    }
    if let Some(unknown) = opts
        .resource_types
        .iter()
        .find(|t| !JUNAR_RESOURCES.contains(&t.as_str()))
    {
        return Err(Error::invalid_options(
            "junar",
            format!("unknown resource type '{unknown}'"),
        ));
    }

    let root = base(api_url);
    let sections = opts
        .resource_types
        .iter()
        .map(|resource| {
            let mut request = HttpRequest::get(format!("{root}/api/v2/{resource}.json"));
            if let Some(key) = &opts.api_key {
                request = request.query("auth_key", key);
            }
            let paginator = OffsetPaginator::new(
                request,
                "offset",
                "limit",
                opts.rows,
                // some instances answer with a bare array
                RecordsAt::path("results").or(""),
            )
            .with_total("count");
            Section::labelled(resource.clone(), Box::new(paginator))
        })
        .collect();
    Ok(Box::new(MultiEndpointPaginator::new(sections)))
}

/// Options of `knoema`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KnoemaOptions {}

fn knoema(api_url: &str, options: &Value) -> Result<Box<dyn PaginationStrategy>> {
    let _: KnoemaOptions = parse_options("knoema", options)?;
    let paginator = IndexPaginator::new(
        HttpRequest::get(format!("{}/1.0/dcat/", base(api_url))).format(ResponseFormat::Xml),
        Some("@about".into()),
    )
    .listed_at("RDF.Catalog.Dataset")
    .record_at("RDF.Dataset");
    Ok(Box::new(paginator))
}
