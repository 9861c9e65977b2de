// Evaluates PAC scripts with boa_engine.
//
// A PAC script defines FindProxyForURL(url, host) and may call a fixed set
// of helper functions:
// https://developer.mozilla.org/en-US/docs/Web/HTTP/Proxy_servers_and_tunneling/Proxy_Auto-Configuration_(PAC)_file
use crate::hosts::compile_glob;
use crate::netmonitor::{is_loopback_or_link_local, probe_route, PRIVATE_PROBES, PUBLIC_PROBES};
use anyhow::{anyhow, bail, Context as _, Result};
use boa_engine::{js_string, Context, JsArgs, JsResult, JsValue, NativeFunction, Source};
use chrono::{Datelike, Local, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};
use url::Url;

/// Holds the current PAC source and runs FindProxyForURL against it. boa
/// contexts are single-threaded, so each evaluation builds a fresh context
/// from the stored source; the mutex serializes evaluations and makes PAC
/// updates happen-before the evaluations that follow them.
#[derive(Clone)]
pub struct PacRunner {
    source: Arc<Mutex<Option<String>>>,
}

impl PacRunner {
    pub fn new() -> Self {
        PacRunner {
            source: Arc::new(Mutex::new(None)),
        }
    }

    /// Replaces the PAC script. The new script is compiled and run once up
    /// front; if that fails the previous script stays in place.
    pub fn update(&self, pacjs: &[u8]) -> Result<()> {
        let text = std::str::from_utf8(pacjs)
            .context("PAC script is not valid UTF-8")?
            .to_string();
        let mut context = Context::default();
        register_pac_helpers(&mut context)?;
        context
            .eval(Source::from_bytes(text.as_bytes()))
            .map_err(|e| anyhow!("error running PAC script: {}", e))?;
        *self.source.lock().unwrap() = Some(text);
        Ok(())
    }

    pub fn find_proxy_for_url(&self, url: &Url) -> Result<String> {
        let guard = self.source.lock().unwrap();
        let source = guard.as_ref().ok_or_else(|| anyhow!("no PAC script loaded"))?;
        let mut url = url.clone();
        // CONNECT request targets have no scheme on the wire; they arrive
        // here already rewritten as https URLs. Strip the path, query and
        // fragment of https and wss URLs before they reach the script, like
        // Chrome does, so that query strings never leak into PAC scripts.
        if matches!(url.scheme(), "https" | "wss") {
            url.set_path("/");
            url.set_query(None);
            url.set_fragment(None);
        }
        let host = url
            .host_str()
            .unwrap_or_default()
            .trim_matches(|c| c == '[' || c == ']')
            .to_string();
        evaluate(source, url.as_str(), &host)
    }
}

fn evaluate(source: &str, url: &str, host: &str) -> Result<String> {
    let mut context = Context::default();
    register_pac_helpers(&mut context)?;
    context
        .eval(Source::from_bytes(source.as_bytes()))
        .map_err(|e| anyhow!("error running PAC script: {}", e))?;
    let global = context.global_object();
    let func = global
        .get(js_string!("FindProxyForURL"), &mut context)
        .map_err(|e| anyhow!("error looking up FindProxyForURL: {}", e))?;
    let func = func
        .as_callable()
        .ok_or_else(|| anyhow!("PAC script doesn't define FindProxyForURL"))?;
    let result = func
        .call(
            &JsValue::undefined(),
            &[
                JsValue::String(js_string!(url)),
                JsValue::String(js_string!(host)),
            ],
            &mut context,
        )
        .map_err(|e| anyhow!("error calling FindProxyForURL: {}", e))?;
    match result.as_string() {
        Some(s) => Ok(s.to_std_string_escaped()),
        None => bail!("FindProxyForURL didn't return a string"),
    }
}

fn register_pac_helpers(context: &mut Context) -> Result<()> {
    type Helper = fn(&JsValue, &[JsValue], &mut Context) -> JsResult<JsValue>;
    let mut set = |name: &str, argc: usize, f: Helper| {
        context
            .register_global_builtin_callable(
                js_string!(name),
                argc,
                NativeFunction::from_fn_ptr(f),
            )
            .map_err(|e| anyhow!("error registering {}: {}", name, e))
    };
    set("isPlainHostName", 1, pac_is_plain_host_name)?;
    set("dnsDomainIs", 2, pac_dns_domain_is)?;
    set("localHostOrDomainIs", 2, pac_local_host_or_domain_is)?;
    set("isResolvable", 1, pac_is_resolvable)?;
    set("isInNet", 3, pac_is_in_net)?;
    set("dnsResolve", 1, pac_dns_resolve)?;
    set("convert_addr", 1, pac_convert_addr)?;
    set("myIpAddress", 0, pac_my_ip_address)?;
    set("dnsDomainLevels", 1, pac_dns_domain_levels)?;
    set("shExpMatch", 2, pac_sh_exp_match)?;
    set("weekdayRange", 3, pac_weekday_range)?;
    set("dateRange", 7, pac_date_range)?;
    set("timeRange", 7, pac_time_range)?;
    set("alert", 1, pac_alert)?;
    Ok(())
}

fn string_arg(args: &[JsValue], i: usize, context: &mut Context) -> JsResult<String> {
    Ok(args
        .get_or_undefined(i)
        .to_string(context)?
        .to_std_string_escaped())
}

/// isPlainHostName(host) is true when the hostname contains no dot.
fn pac_is_plain_host_name(
    _this: &JsValue,
    args: &[JsValue],
    context: &mut Context,
) -> JsResult<JsValue> {
    let host = string_arg(args, 0, context)?;
    Ok(JsValue::Boolean(!host.contains('.')))
}

/// dnsDomainIs(host, domain) is a plain suffix test. The suffix is not
/// required to start with a dot, so dnsDomainIs("notanz.com", "anz.com")
/// is true; this matches Chrome.
fn pac_dns_domain_is(
    _this: &JsValue,
    args: &[JsValue],
    context: &mut Context,
) -> JsResult<JsValue> {
    let host = string_arg(args, 0, context)?;
    let domain = string_arg(args, 1, context)?;
    Ok(JsValue::Boolean(host.ends_with(&domain)))
}

fn pac_local_host_or_domain_is(
    _this: &JsValue,
    args: &[JsValue],
    context: &mut Context,
) -> JsResult<JsValue> {
    let host = string_arg(args, 0, context)?;
    let hostdom = string_arg(args, 1, context)?;
    Ok(JsValue::Boolean(
        host == hostdom || hostdom.starts_with(&format!("{}.", host)),
    ))
}

fn pac_is_resolvable(
    _this: &JsValue,
    args: &[JsValue],
    context: &mut Context,
) -> JsResult<JsValue> {
    let host = string_arg(args, 0, context)?;
    let resolvable = dns_lookup::lookup_host(&host)
        .map(|addrs| !addrs.is_empty())
        .unwrap_or(false);
    Ok(JsValue::Boolean(resolvable))
}

/// isInNet(host, pattern, mask) compares the IPv4 address of host against
/// pattern under mask. A mask that isn't a dotted quad yields false.
fn pac_is_in_net(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let host = string_arg(args, 0, context)?;
    let pattern = string_arg(args, 1, context)?;
    let mask = string_arg(args, 2, context)?;
    let result = (|| {
        let host: Ipv4Addr = resolve_v4(&host)?;
        let pattern: Ipv4Addr = pattern.parse().ok()?;
        let mask: Ipv4Addr = mask.parse().ok()?;
        let (host, pattern, mask) = (u32::from(host), u32::from(pattern), u32::from(mask));
        Some(host & mask == pattern & mask)
    })();
    Ok(JsValue::Boolean(result.unwrap_or(false)))
}

fn pac_dns_resolve(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let host = string_arg(args, 0, context)?;
    match resolve_v4(&host) {
        Some(ip) => Ok(JsValue::String(js_string!(ip.to_string()))),
        None => Ok(JsValue::null()),
    }
}

/// convert_addr(ip) packs a dotted quad into a big-endian number; anything
/// else converts to 0.
fn pac_convert_addr(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let ipaddr = string_arg(args, 0, context)?;
    let n = ipaddr
        .parse::<Ipv4Addr>()
        .map(u32::from)
        .unwrap_or_default();
    Ok(JsValue::from(n as f64))
}

fn pac_my_ip_address(
    _this: &JsValue,
    _args: &[JsValue],
    _context: &mut Context,
) -> JsResult<JsValue> {
    Ok(JsValue::String(js_string!(my_ip_address())))
}

fn pac_dns_domain_levels(
    _this: &JsValue,
    args: &[JsValue],
    context: &mut Context,
) -> JsResult<JsValue> {
    let host = string_arg(args, 0, context)?;
    let count = host.chars().filter(|&c| c == '.').count();
    Ok(JsValue::Integer(count as i32))
}

/// shExpMatch(str, shexp) does a shell-glob match; a pattern that fails to
/// compile yields undefined.
fn pac_sh_exp_match(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let s = string_arg(args, 0, context)?;
    let pattern = string_arg(args, 1, context)?;
    match compile_glob(&pattern) {
        Ok(re) => Ok(JsValue::Boolean(re.is_match(&s))),
        Err(_) => Ok(JsValue::undefined()),
    }
}

fn pac_weekday_range(
    _this: &JsValue,
    args: &[JsValue],
    context: &mut Context,
) -> JsResult<JsValue> {
    let args = to_pac_args(args, context)?;
    Ok(tristate(weekday_range(
        &args,
        Local::now().naive_local(),
        Utc::now().naive_utc(),
    )))
}

fn pac_date_range(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let args = to_pac_args(args, context)?;
    Ok(tristate(date_range(
        &args,
        Local::now().naive_local(),
        Utc::now().naive_utc(),
    )))
}

fn pac_time_range(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let args = to_pac_args(args, context)?;
    Ok(tristate(time_range(
        &args,
        Local::now().naive_local(),
        Utc::now().naive_utc(),
    )))
}

/// alert(msg) has nowhere useful to go, so it lands in the debug log.
fn pac_alert(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let msg = string_arg(args, 0, context)?;
    tracing::debug!("PAC alert: {}", msg);
    Ok(JsValue::undefined())
}

// ─── DNS and address helpers ─────────────────────────────────────────────

/// Returns the host's IPv4 address: the host itself if it already is one,
/// otherwise the first IPv4 result from DNS.
fn resolve_v4(host: &str) -> Option<Ipv4Addr> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Some(ip);
    }
    dns_lookup::lookup_host(host)
        .ok()?
        .into_iter()
        .find_map(|addr| match addr {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
}

/// Best-effort guess at "my" IP address, in decreasing order of usefulness:
/// the interface routing to the public internet (v4 then v6), then whatever
/// the local hostname resolves to, then interfaces routing to private
/// ranges, then loopback. Loopback and link-local candidates are skipped
/// along the way.
pub fn my_ip_address() -> String {
    for dest in PUBLIC_PROBES {
        if let Some(ip) = probe_route(dest) {
            return ip.to_string();
        }
    }
    if let Ok(name) = hostname::get() {
        if let Ok(addrs) = dns_lookup::lookup_host(&name.to_string_lossy()) {
            let usable: Vec<&IpAddr> = addrs
                .iter()
                .filter(|ip| !is_loopback_or_link_local(ip))
                .collect();
            if let Some(ip) = usable.iter().find(|ip| ip.is_ipv4()) {
                return ip.to_string();
            }
            if let Some(ip) = usable.first() {
                return ip.to_string();
            }
        }
    }
    for dest in PRIVATE_PROBES {
        if let Some(ip) = probe_route(dest) {
            return ip.to_string();
        }
    }
    "127.0.0.1".to_string()
}

// ─── Time range helpers ──────────────────────────────────────────────────
//
// These mirror the classic Netscape semantics: an optional trailing "GMT"
// argument selects UTC instead of local time, and any malformed argument
// set yields undefined (None here) rather than an exception.

enum PacArg {
    Num(f64),
    Str(String),
}

fn to_pac_args(args: &[JsValue], context: &mut Context) -> JsResult<Vec<PacArg>> {
    args.iter()
        .map(|v| match v.as_number() {
            Some(n) => Ok(PacArg::Num(n)),
            None => Ok(PacArg::Str(v.to_string(context)?.to_std_string_escaped())),
        })
        .collect()
}

fn tristate(value: Option<bool>) -> JsValue {
    match value {
        Some(b) => JsValue::Boolean(b),
        None => JsValue::undefined(),
    }
}

fn is_gmt(arg: Option<&PacArg>) -> bool {
    matches!(arg, Some(PacArg::Str(s)) if s == "GMT")
}

fn weekday_number(arg: Option<&PacArg>) -> Option<u32> {
    const WEEKDAYS: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];
    match arg {
        Some(PacArg::Str(s)) => WEEKDAYS.iter().position(|w| w == s).map(|p| p as u32),
        _ => None,
    }
}

fn weekday_range(args: &[PacArg], local: NaiveDateTime, utc: NaiveDateTime) -> Option<bool> {
    let now = if is_gmt(args.last()) { utc } else { local };
    let today = now.weekday().num_days_from_sunday();
    let wd1 = weekday_number(args.first())?;
    let Some(wd2) = weekday_number(args.get(1)) else {
        return Some(today == wd1);
    };
    if wd1 <= wd2 {
        Some(wd1 <= today && today <= wd2)
    } else {
        Some(today == wd1 || today == wd2)
    }
}

fn month_number(s: &str) -> Option<u32> {
    const MONTHS: [&str; 12] = [
        "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
    ];
    MONTHS.iter().position(|m| m == &s).map(|p| p as u32 + 1)
}

fn date_range(args: &[PacArg], local: NaiveDateTime, utc: NaiveDateTime) -> Option<bool> {
    let gmt = is_gmt(args.last());
    let now = if gmt { utc } else { local };
    let args = if gmt { &args[..args.len() - 1] } else { args };

    let mut days: Vec<u32> = Vec::new();
    let mut months: Vec<u32> = Vec::new();
    let mut years: Vec<i32> = Vec::new();
    for arg in args {
        match arg {
            PacArg::Num(n) => {
                let n = n.trunc() as i64;
                if (1..=31).contains(&n) {
                    days.push(n as u32);
                } else {
                    years.push(i32::try_from(n).ok()?);
                }
            }
            PacArg::Str(s) => months.push(month_number(s)?),
        }
    }

    match days.len().max(months.len()).max(years.len()) {
        1 => {
            // One (possibly partial) date; match it field by field.
            if days.first().is_some_and(|&d| d != now.day()) {
                Some(false)
            } else if months.first().is_some_and(|&m| m != now.month()) {
                Some(false)
            } else if years.first().is_some_and(|&y| y != now.year()) {
                Some(false)
            } else {
                Some(true)
            }
        }
        2 => {
            // Two dates; check that now is inside the inclusive range.
            // Unspecified fields default to the current date.
            let (mut y1, mut y2) = (now.year(), now.year());
            let (mut m1, mut m2) = (now.month(), now.month());
            let (mut d1, mut d2) = (now.day(), now.day());
            if days.len() == 2 {
                (d1, d2) = (days[0], days[1]);
            }
            if months.len() == 2 {
                (m1, m2) = (months[0], months[1]);
            }
            if years.len() == 2 {
                (y1, y2) = (years[0], years[1]);
            }
            let start = NaiveDate::from_ymd_opt(y1, m1, d1)?.and_time(now.time());
            let end = NaiveDate::from_ymd_opt(y2, m2, d2)?.and_time(now.time());
            Some(start <= now && now <= end)
        }
        _ => None,
    }
}

fn time_range(args: &[PacArg], local: NaiveDateTime, utc: NaiveDateTime) -> Option<bool> {
    let gmt = is_gmt(args.last());
    let now = if gmt { utc } else { local };
    let args = if gmt { &args[..args.len() - 1] } else { args };

    let num = |i: usize| -> Option<u32> {
        match args.get(i) {
            Some(PacArg::Num(n)) => u32::try_from(n.trunc() as i64).ok(),
            _ => None,
        }
    };
    let (h1, m1, s1, h2, m2, s2) = match args.len() {
        1 => {
            let h = num(0)?;
            (h, 0, 0, h + 1, 0, 0)
        }
        2 => (num(0)?, 0, 0, num(1)?, 0, 0),
        4 => (num(0)?, num(1)?, 0, num(2)?, num(3)?, 0),
        6 => (num(0)?, num(1)?, num(2)?, num(3)?, num(4)?, num(5)?),
        _ => return None,
    };
    let start = NaiveTime::from_hms_opt(h1, m1, s1)?;
    let now = now.time();
    if h2 >= 24 {
        // A range like timeRange(23) ends at 24:00, i.e. end of day.
        return Some(start <= now);
    }
    let end = NaiveTime::from_hms_opt(h2, m2, s2)?;
    Some(start <= now && now < end)
}
