//! Secret masking for configuration copies, log lines and command lines.

use regex::Regex;
use std::borrow::Cow;

pub const PAT_KEY: &str = "dremio-pat-token";
pub const REDACTED: &str = "REDACTED";
pub const REMOVED_SECRET: &str = "REMOVED_POTENTIAL_SECRET";

lazy_static::lazy_static! {
    // `key = value`, `key: value` and `<name>key</name>` forms whose key mentions a secret.
    static ref SECRET_ASSIGNMENT: Regex = Regex::new(
        r#"(?i)^(\s*[A-Za-z0-9_.\-"]*(?:password|passwd|pass|secret|token|credential|accesskey|access\.key|secret\.key)[A-Za-z0-9_.\-"]*\s*[:=]\s*)(\S.*)$"#
    )
    .expect("secret assignment regex");
    static ref SECRET_XML_NAME: Regex = Regex::new(
        r"(?i)<name>[^<]*(?:password|secret|token|credential|access\.key|secret\.key)[^<]*</name>"
    )
    .expect("secret xml name regex");
    static ref XML_VALUE: Regex = Regex::new(r"(?i)(<value>)[^<]*(</value>)").expect("xml value regex");
}

/// Masks `value` when `key` names the access token.
pub fn mask_value<'a>(key: &str, value: &'a str) -> Cow<'a, str> {
    if key.trim_start_matches('-') == PAT_KEY && !value.is_empty() {
        Cow::Borrowed(REDACTED)
    } else {
        Cow::Borrowed(value)
    }
}

/// `key: value` with the token masked.
pub fn log_line(key: &str, value: &str) -> String {
    format!("{key}: {}", mask_value(key, value))
}

/// Copies an argv list, masking the value following `--dremio-pat-token`
/// and any `--dremio-pat-token=` element.
pub fn mask_args<S: AsRef<str>>(argv: &[S]) -> Vec<String> {
    let flag = format!("--{PAT_KEY}");
    let inline = format!("{flag}=");
    let mut masked = Vec::with_capacity(argv.len());
    let mut mask_next = false;
    for arg in argv {
        let arg = arg.as_ref();
        if mask_next {
            masked.push(REDACTED.to_string());
            mask_next = false;
        } else if arg == flag {
            masked.push(arg.to_string());
            mask_next = true;
        } else if arg.starts_with(&inline) {
            masked.push(format!("{inline}{REDACTED}"));
        } else {
            masked.push(arg.to_string());
        }
    }
    masked
}

/// Masks every occurrence of a known secret inside free text.
pub fn scrub(text: &str, secret: &str) -> String {
    if secret.is_empty() {
        text.to_string()
    } else {
        text.replace(secret, REDACTED)
    }
}

/// Redacts values of secret-looking keys in a configuration file body.
/// Handles line-oriented formats (HOCON, properties, YAML, shell env) and
/// Hadoop-style XML where the value follows the `<name>` element.
pub fn redact_config(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    let mut pending_xml_value = false;
    for line in body.lines() {
        let redacted = if SECRET_XML_NAME.is_match(line) {
            if XML_VALUE.is_match(line) {
                XML_VALUE
                    .replace(line, format!("${{1}}{REMOVED_SECRET}${{2}}"))
                    .into_owned()
            } else {
                pending_xml_value = true;
                line.to_string()
            }
        } else if pending_xml_value && XML_VALUE.is_match(line) {
            pending_xml_value = false;
            XML_VALUE
                .replace(line, format!("${{1}}{REMOVED_SECRET}${{2}}"))
                .into_owned()
        } else if is_comment(line) {
            line.to_string()
        } else {
            SECRET_ASSIGNMENT
                .replace(line, format!("${{1}}\"{REMOVED_SECRET}\""))
                .into_owned()
        };
        out.push_str(&redacted);
        out.push('\n');
    }
    out
}

fn is_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with('#') || trimmed.starts_with("//")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn pat_key_is_masked() {
        let line = log_line("dremio-pat-token", "abc123-very-secret");
        assert!(line.contains(REDACTED));
        assert!(!line.contains("abc123-very-secret"));
        assert_eq!(log_line("dremio-endpoint", "http://x:9047"), "dremio-endpoint: http://x:9047");
    }

    #[test]
    fn empty_pat_is_left_empty() {
        assert_eq!(log_line("dremio-pat-token", ""), "dremio-pat-token: ");
    }

    #[test]
    fn args_are_masked() {
        let argv = [
            "local-collect",
            "--dremio-pat-token",
            "tok",
            "--dremio-pat-token=tok2",
            "--verbose",
        ];
        assert_eq!(
            mask_args(&argv),
            vec![
                "local-collect",
                "--dremio-pat-token",
                "REDACTED",
                "--dremio-pat-token=REDACTED",
                "--verbose",
            ]
        );
    }

    #[test]
    fn config_secrets_removed() {
        let body = "\
services.coordinator.web.ssl.keyStorePassword: \"hunter2\"
paths.local: /var/lib/dremio
# password: keep-comment
<property>
  <name>fs.s3a.secret.key</name>
  <value>AKIASECRET</value>
</property>
";
        let redacted = redact_config(body);
        assert!(!redacted.contains("hunter2"));
        assert!(!redacted.contains("AKIASECRET"));
        assert!(redacted.contains("paths.local: /var/lib/dremio"));
        assert!(redacted.contains("# password: keep-comment"));
        assert_eq!(redacted.matches(REMOVED_SECRET).count(), 2);
    }
}
