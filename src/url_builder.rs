//! URL and form body construction for cloud requests.

use url::form_urlencoded;

/// Builds `base + subpath`, followed by `?` and the percent-encoded
/// parameters in the given order when `params` is not empty.
pub fn build_url(base: &str, subpath: &str, params: &[(&str, &str)]) -> String {
    let mut url = format!("{base}{subpath}");

    if !params.is_empty() {
        url.push('?');
        url.push_str(&encode_params(params));
    }

    url
}

/// Encodes parameters as `application/x-www-form-urlencoded`, keeping their order.
pub fn encode_params(params: &[(&str, &str)]) -> String {
    form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params)
        .finish()
}
