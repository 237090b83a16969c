use std::str::FromStr;

use xds_api::pb::envoy::{
    config::route::v3::{
        self as xds_route, header_matcher::HeaderMatchSpecifier,
        query_parameter_matcher::QueryParameterMatchSpecifier,
    },
    r#type::matcher::v3::{string_matcher::MatchPattern, StringMatcher},
};

use crate::{
    error::{Error, ErrorContext},
    http::{
        HeaderMatcher, Matcher, PathMatcher, QueryParameterMatcher, RedirectAction, RetryPolicy,
    },
    shared::Regex,
    xds::shared::{exact_string_matcher, regex_matcher},
};

impl Matcher {
    pub fn to_xds(&self) -> Result<xds_route::RouteMatch, Error> {
        let path_specifier = Some(self.path.to_xds());

        let mut headers = vec![];
        if let Some(method) = method_matcher(&self.methods) {
            headers.push(method);
        }
        for (i, header) in self.headers.iter().enumerate() {
            headers.push(header.to_xds().with_field_index("headers", i)?);
        }

        let mut query_parameters = vec![];
        for (i, param) in self.query_parameters.iter().enumerate() {
            query_parameters.push(param.to_xds().with_field_index("query_parameters", i)?);
        }

        Ok(xds_route::RouteMatch {
            path_specifier,
            headers,
            query_parameters,
            ..Default::default()
        })
    }
}

// a single method is an exact match on the :method pseudo-header. more than
// one gets folded into a single anchored regex.
fn method_matcher(methods: &[String]) -> Option<xds_route::HeaderMatcher> {
    let pattern = match methods {
        [] => return None,
        [method] => MatchPattern::Exact(method.clone()),
        methods => {
            let regex = format!("^({})$", methods.join("|"));
            MatchPattern::SafeRegex(xds_api::pb::envoy::r#type::matcher::v3::RegexMatcher {
                regex,
                engine_type: None,
            })
        }
    };

    Some(xds_route::HeaderMatcher {
        name: ":method".to_string(),
        header_match_specifier: Some(HeaderMatchSpecifier::StringMatch(StringMatcher {
            match_pattern: Some(pattern),
            ignore_case: false,
        })),
        ..Default::default()
    })
}

impl PathMatcher {
    pub fn to_xds(&self) -> xds_route::route_match::PathSpecifier {
        use xds_route::route_match::PathSpecifier;

        match self {
            PathMatcher::Exact { value } => PathSpecifier::Path(value.clone()),
            PathMatcher::Prefix { value } => PathSpecifier::Prefix(value.clone()),
            PathMatcher::Regex { value } => PathSpecifier::SafeRegex(regex_matcher(value)),
        }
    }
}

impl HeaderMatcher {
    pub fn to_xds(&self) -> Result<xds_route::HeaderMatcher, Error> {
        let specifier = match &self.value {
            None => HeaderMatchSpecifier::PresentMatch(true),
            Some(value) => HeaderMatchSpecifier::StringMatch(string_matcher(value, self.regex)?),
        };

        Ok(xds_route::HeaderMatcher {
            name: self.name.clone(),
            header_match_specifier: Some(specifier),
            invert_match: self.invert_match,
            ..Default::default()
        })
    }
}

impl QueryParameterMatcher {
    pub fn to_xds(&self) -> Result<xds_route::QueryParameterMatcher, Error> {
        let specifier = match &self.value {
            None => QueryParameterMatchSpecifier::PresentMatch(true),
            Some(value) => {
                QueryParameterMatchSpecifier::StringMatch(string_matcher(value, self.regex)?)
            }
        };

        Ok(xds_route::QueryParameterMatcher {
            name: self.name.clone(),
            query_parameter_match_specifier: Some(specifier),
        })
    }
}

fn string_matcher(value: &str, regex: bool) -> Result<StringMatcher, Error> {
    if !regex {
        return Ok(exact_string_matcher(value));
    }

    let regex = Regex::from_str(value)
        .map_err(|e| Error::new(format!("invalid regex: {e}")))
        .with_field("value")?;
    Ok(StringMatcher {
        match_pattern: Some(MatchPattern::SafeRegex(regex_matcher(&regex))),
        ignore_case: false,
    })
}

impl RedirectAction {
    pub fn to_xds(&self) -> Result<xds_route::RedirectAction, Error> {
        use xds_route::redirect_action::{
            PathRewriteSpecifier, RedirectResponseCode, SchemeRewriteSpecifier,
        };

        let response_code = match self.response_code.unwrap_or(301) {
            301 => RedirectResponseCode::MovedPermanently,
            302 => RedirectResponseCode::Found,
            303 => RedirectResponseCode::SeeOther,
            307 => RedirectResponseCode::TemporaryRedirect,
            308 => RedirectResponseCode::PermanentRedirect,
            code => {
                return Err(Error::new(format!("unsupported redirect code {code}")))
                    .with_field("response_code")
            }
        };

        let scheme_rewrite_specifier = self
            .https_redirect
            .then_some(SchemeRewriteSpecifier::HttpsRedirect(true));

        let path_rewrite_specifier = self
            .path_redirect
            .as_ref()
            .map(|p| PathRewriteSpecifier::PathRedirect(p.clone()));

        Ok(xds_route::RedirectAction {
            host_redirect: self.host_redirect.clone().unwrap_or_default(),
            scheme_rewrite_specifier,
            path_rewrite_specifier,
            response_code: response_code as i32,
            strip_query: self.strip_query,
            ..Default::default()
        })
    }
}

impl RetryPolicy {
    pub fn to_xds(&self) -> xds_route::RetryPolicy {
        xds_route::RetryPolicy {
            retry_on: self.retry_on.clone(),
            num_retries: Some(self.num_retries.into()),
            per_try_timeout: self.per_try_timeout.map(|d| d.to_xds()),
            ..Default::default()
        }
    }
}
