//! Document extractor.
//!
//! Turns one raw tactic file into the flat technique → sub-technique →
//! strategy document list. Tactic files are JavaScript modules of the form
//! `export const harden = { ... };` whose object literal is JSON plus
//! comments and trailing commas; `.json` files are parsed as-is.
//!
//! Strategy ids are derived as `{sub_id}.S{n}` (1-based, in source order),
//! so the same source always yields the same ids.

use defense_kb_core::models::{DocType, Document, ImplementationStrategy, ThreatMapping};
use regex::Regex;
use serde::{Deserialize, Deserializer};
use std::path::Path;
use std::sync::OnceLock;

use crate::error::ExtractError;

static TAG: OnceLock<Regex> = OnceLock::new();

// ============ Source schema ============

#[derive(Debug, Deserialize)]
struct SourceTactic {
    name: String,
    techniques: Vec<SourceTechnique>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SourceTechnique {
    id: String,
    #[serde(default = "unknown")]
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default, deserialize_with = "string_or_list")]
    pillar: String,
    #[serde(default, deserialize_with = "string_or_list")]
    phase: String,
    #[serde(default)]
    defends_against: Vec<SourceMapping>,
    #[serde(default, deserialize_with = "tool_names")]
    tools_open_source: Vec<String>,
    #[serde(default, deserialize_with = "tool_names")]
    tools_commercial: Vec<String>,
    #[serde(default)]
    sub_techniques: Vec<SourceSubTechnique>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SourceSubTechnique {
    id: String,
    #[serde(default = "unknown")]
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default, deserialize_with = "string_or_list")]
    pillar: String,
    #[serde(default, deserialize_with = "string_or_list")]
    phase: String,
    #[serde(default)]
    defends_against: Vec<SourceMapping>,
    #[serde(default, deserialize_with = "tool_names")]
    tools_open_source: Vec<String>,
    #[serde(default, deserialize_with = "tool_names")]
    tools_commercial: Vec<String>,
    #[serde(default)]
    implementation_strategies: Vec<SourceStrategy>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SourceStrategy {
    #[serde(default = "default_strategy")]
    strategy: String,
    #[serde(default)]
    how_to: String,
}

#[derive(Debug, Deserialize)]
struct SourceMapping {
    #[serde(default)]
    framework: String,
    #[serde(default)]
    items: Vec<String>,
}

fn unknown() -> String {
    "Unknown".to_string()
}

fn default_strategy() -> String {
    "Strategy".to_string()
}

/// Accept `"data"`, `["data", "model"]`, or `null`.
fn string_or_list<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    let value = serde_json::Value::deserialize(d)?;
    Ok(match value {
        serde_json::Value::String(s) => s.trim().to_string(),
        serde_json::Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(", "),
        _ => String::new(),
    })
}

/// Tool entries are either plain names or objects carrying a `name`.
fn tool_names<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
    let value = serde_json::Value::deserialize(d)?;
    let serde_json::Value::Array(items) = value else {
        return Ok(Vec::new());
    };
    Ok(items
        .iter()
        .filter_map(|item| match item {
            serde_json::Value::String(s) => Some(s.trim().to_string()),
            serde_json::Value::Object(obj) => obj
                .get("name")
                .and_then(|n| n.as_str())
                .map(|s| s.trim().to_string()),
            _ => None,
        })
        .filter(|s| !s.is_empty())
        .collect())
}

// ============ Entry points ============

/// Extract documents from a downloaded source file.
pub fn extract(path: &Path) -> Result<Vec<Document>, ExtractError> {
    let content = std::fs::read_to_string(path).map_err(|source| ExtractError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let file = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string();

    let docs = parse_source(&content, &file)?;
    tracing::debug!(file = %file, documents = docs.len(), "extracted documents");
    Ok(docs)
}

/// Parse source text (JavaScript module or JSON) into documents.
pub fn parse_source(content: &str, file: &str) -> Result<Vec<Document>, ExtractError> {
    let object = exported_object(content).ok_or_else(|| ExtractError::NoObject(file.to_string()))?;
    let json = to_json(object).map_err(|message| ExtractError::Malformed {
        file: file.to_string(),
        message,
    })?;

    let value: serde_json::Value =
        serde_json::from_str(&json).map_err(|e| ExtractError::Malformed {
            file: file.to_string(),
            message: e.to_string(),
        })?;

    for key in ["name", "techniques"] {
        if value.get(key).is_none() {
            return Err(ExtractError::MissingKey {
                file: file.to_string(),
                key: key.to_string(),
            });
        }
    }

    let tactic: SourceTactic =
        serde_json::from_value(value).map_err(|e| ExtractError::Malformed {
            file: file.to_string(),
            message: e.to_string(),
        })?;

    Ok(flatten(tactic))
}

fn flatten(tactic: SourceTactic) -> Vec<Document> {
    let mut docs = Vec::new();
    let tactic_name = tactic.name.trim().to_string();

    for tech in tactic.techniques {
        docs.push(Document {
            text: format!(
                "Technique: {}\nID: {}\nDescription: {}",
                tech.name,
                tech.id,
                strip_markup(&tech.description)
            ),
            source_id: tech.id.clone(),
            doc_type: DocType::Technique,
            parent_id: None,
            name: tech.name.clone(),
            tactic: tactic_name.clone(),
            pillar: tech.pillar.clone(),
            phase: tech.phase.clone(),
            has_code: has_code(&tech.description),
            body: tech.description,
            threat_mappings: mappings(tech.defends_against),
            tools_opensource: tech.tools_open_source,
            tools_commercial: tech.tools_commercial,
            implementation_strategies: Vec::new(),
        });

        for sub in tech.sub_techniques {
            let pillar = if sub.pillar.is_empty() {
                tech.pillar.clone()
            } else {
                sub.pillar.clone()
            };
            let phase = if sub.phase.is_empty() {
                tech.phase.clone()
            } else {
                sub.phase.clone()
            };

            let mut strategy_docs = Vec::with_capacity(sub.implementation_strategies.len());
            for (i, strat) in sub.implementation_strategies.iter().enumerate() {
                let id = format!("{}.S{}", sub.id, i + 1);
                strategy_docs.push(Document {
                    text: format!(
                        "Implementation Strategy for {}\nStrategy: {}\nID: {}\nHow-To: {}",
                        sub.name,
                        strat.strategy,
                        id,
                        strip_markup(&strat.how_to)
                    ),
                    source_id: id,
                    doc_type: DocType::Strategy,
                    parent_id: Some(sub.id.clone()),
                    name: format!("{} - {}", sub.name, strat.strategy),
                    tactic: tactic_name.clone(),
                    pillar: pillar.clone(),
                    phase: phase.clone(),
                    body: strat.how_to.clone(),
                    threat_mappings: Vec::new(),
                    tools_opensource: Vec::new(),
                    tools_commercial: Vec::new(),
                    implementation_strategies: Vec::new(),
                    has_code: has_code(&strat.how_to),
                });
            }

            let sub_has_code =
                has_code(&sub.description) || strategy_docs.iter().any(|d| d.has_code);

            docs.push(Document {
                text: format!(
                    "Sub-Technique: {}\nID: {}\nParent: {}\nPillar: {}\nPhase: {}\nDescription: {}",
                    sub.name,
                    sub.id,
                    tech.name,
                    pillar,
                    phase,
                    strip_markup(&sub.description)
                ),
                source_id: sub.id.clone(),
                doc_type: DocType::Subtechnique,
                parent_id: Some(tech.id.clone()),
                name: sub.name,
                tactic: tactic_name.clone(),
                pillar,
                phase,
                body: sub.description,
                threat_mappings: mappings(sub.defends_against),
                tools_opensource: sub.tools_open_source,
                tools_commercial: sub.tools_commercial,
                implementation_strategies: sub
                    .implementation_strategies
                    .into_iter()
                    .map(|s| ImplementationStrategy {
                        strategy: s.strategy,
                        how_to: s.how_to,
                    })
                    .collect(),
                has_code: sub_has_code,
            });
            docs.extend(strategy_docs);
        }
    }

    docs
}

fn mappings(source: Vec<SourceMapping>) -> Vec<ThreatMapping> {
    source
        .into_iter()
        .filter(|m| !m.items.is_empty())
        .map(|m| ThreatMapping {
            framework: m.framework,
            items: m.items,
        })
        .collect()
}

// ============ Text helpers ============

/// Replace markup tags with spaces, decode common entities, and collapse
/// whitespace.
pub fn strip_markup(text: &str) -> String {
    let tag = TAG.get_or_init(|| Regex::new(r"<[^>]+>").expect("tag regex must compile"));
    let without_tags = tag.replace_all(text, " ");
    let decoded = without_tags
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&");
    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Whether formatted text embeds a code block.
pub fn has_code(text: &str) -> bool {
    text.contains("<pre") || text.contains("<code") || text.contains("```")
}

// ============ Source scanning ============

/// Locate the exported object literal by balanced-brace scanning.
///
/// With an `export` statement the scan starts after its `=`; otherwise at
/// the first `{` (plain JSON).
fn exported_object(src: &str) -> Option<&str> {
    let from = match src.find("export") {
        Some(i) => i + src[i..].find('=')? + 1,
        None => 0,
    };
    let open = from + src[from..].find('{')?;

    let bytes = src.as_bytes();
    let mut depth = 0usize;
    let mut quote: Option<u8> = None;
    let mut i = open;

    while i < bytes.len() {
        let b = bytes[i];
        if let Some(q) = quote {
            if b == b'\\' {
                i += 2;
                continue;
            }
            if b == q {
                quote = None;
            }
            i += 1;
            continue;
        }

        match b {
            b'"' | b'\'' | b'`' => quote = Some(b),
            b'/' if bytes.get(i + 1) == Some(&b'/') => {
                i = skip_line_comment(bytes, i);
                continue;
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i = skip_block_comment(bytes, i);
                continue;
            }
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&src[open..=i]);
                }
            }
            _ => {}
        }
        i += 1;
    }

    None
}

fn skip_line_comment(bytes: &[u8], start: usize) -> usize {
    let mut i = start;
    while i < bytes.len() && bytes[i] != b'\n' {
        i += 1;
    }
    i
}

fn skip_block_comment(bytes: &[u8], start: usize) -> usize {
    let mut i = start + 2;
    while i + 1 < bytes.len() {
        if bytes[i] == b'*' && bytes[i + 1] == b'/' {
            return i + 2;
        }
        i += 1;
    }
    bytes.len()
}

/// Strip comments and trailing commas outside string literals.
fn to_json(object: &str) -> Result<String, String> {
    let bytes = object.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut in_string = false;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        if in_string {
            out.push(b);
            if b == b'\\' {
                if let Some(&next) = bytes.get(i + 1) {
                    out.push(next);
                }
                i += 2;
                continue;
            }
            if b == b'"' {
                in_string = false;
            }
            i += 1;
            continue;
        }

        match b {
            b'"' => {
                in_string = true;
                out.push(b);
                i += 1;
            }
            b'/' if bytes.get(i + 1) == Some(&b'/') => i = skip_line_comment(bytes, i),
            b'/' if bytes.get(i + 1) == Some(&b'*') => i = skip_block_comment(bytes, i),
            b',' if closes_after(bytes, i + 1) => i += 1,
            _ => {
                out.push(b);
                i += 1;
            }
        }
    }

    String::from_utf8(out).map_err(|e| e.to_string())
}

/// Whether the next significant byte after `from` closes an object or array.
fn closes_after(bytes: &[u8], from: usize) -> bool {
    let mut i = from;
    while i < bytes.len() {
        match bytes[i] {
            b' ' | b'\t' | b'\r' | b'\n' => i += 1,
            b'/' if bytes.get(i + 1) == Some(&b'/') => i = skip_line_comment(bytes, i),
            b'/' if bytes.get(i + 1) == Some(&b'*') => i = skip_block_comment(bytes, i),
            b'}' | b']' => return true,
            _ => return false,
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    const HARDEN: &str = r#"
// AIDEFEND tactic: Harden
export const harden = {
    "name": "Harden",
    "purpose": "Make models resilient", /* not used */
    "techniques": [
        {
            "id": "AID-H-001",
            "name": "Input Validation",
            "description": "<p>Validate inputs at https://example.com//path</p>",
            "pillar": "app",
            "phase": "building",
            "defendsAgainst": [
                { "framework": "OWASP LLM Top 10 2025", "items": ["LLM01:2025 Prompt Injection"] },
                { "framework": "MAESTRO", "items": [] },
            ],
            "toolsOpenSource": ["garak", { "name": "rebuff", "url": "x" }],
            "toolsCommercial": [],
            "subTechniques": [
                {
                    "id": "AID-H-001.001",
                    "name": "Schema Enforcement",
                    "description": "Enforce a schema &amp; reject the rest.",
                    "phase": "operation",
                    "implementationStrategies": [
                        { "strategy": "Use JSON schema", "howTo": "<h5>Step</h5><pre><code>validate(x)</code></pre>" },
                        { "strategy": "Reject unknown fields", "howTo": "Deny by default." },
                    ],
                },
            ],
        },
        {
            "id": "AID-H-002",
            "name": "Prompt Hardening",
        },
    ],
};
"#;

    #[test]
    fn test_flattens_hierarchy_in_source_order() {
        let docs = parse_source(HARDEN, "harden.js").unwrap();
        let ids: Vec<&str> = docs.iter().map(|d| d.source_id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "AID-H-001",
                "AID-H-001.001",
                "AID-H-001.001.S1",
                "AID-H-001.001.S2",
                "AID-H-002"
            ]
        );
        assert!(docs.iter().all(|d| d.tactic == "Harden"));
    }

    #[test]
    fn test_technique_fields() {
        let docs = parse_source(HARDEN, "harden.js").unwrap();
        let tech = &docs[0];
        assert_eq!(tech.doc_type, DocType::Technique);
        assert_eq!(tech.parent_id, None);
        assert_eq!(tech.tools_opensource, vec!["garak", "rebuff"]);
        assert_eq!(tech.threat_mappings.len(), 1);
        assert_eq!(
            tech.text,
            "Technique: Input Validation\nID: AID-H-001\nDescription: Validate inputs at https://example.com//path"
        );
        assert!(tech.body.starts_with("<p>"));
    }

    #[test]
    fn test_subtechnique_inherits_missing_tags() {
        let docs = parse_source(HARDEN, "harden.js").unwrap();
        let sub = &docs[1];
        assert_eq!(sub.parent_id.as_deref(), Some("AID-H-001"));
        assert_eq!(sub.pillar, "app");
        assert_eq!(sub.phase, "operation");
        assert!(sub.text.contains("Parent: Input Validation"));
        assert!(sub.text.ends_with("Enforce a schema & reject the rest."));
        assert_eq!(sub.implementation_strategies.len(), 2);
        assert!(sub.has_code);
    }

    #[test]
    fn test_strategy_documents() {
        let docs = parse_source(HARDEN, "harden.js").unwrap();
        let s1 = &docs[2];
        assert_eq!(s1.doc_type, DocType::Strategy);
        assert_eq!(s1.parent_id.as_deref(), Some("AID-H-001.001"));
        assert_eq!(s1.name, "Schema Enforcement - Use JSON schema");
        assert_eq!(s1.phase, "operation");
        assert!(s1.has_code);
        assert!(s1.text.ends_with("How-To: Step validate(x)"));
        assert!(!docs[3].has_code);
    }

    #[test]
    fn test_missing_optional_attributes() {
        let docs = parse_source(HARDEN, "harden.js").unwrap();
        let bare = &docs[4];
        assert_eq!(bare.pillar, "");
        assert!(bare.tools_commercial.is_empty());
        assert!(bare.threat_mappings.is_empty());
    }

    #[test]
    fn test_missing_required_key_fails() {
        let err = parse_source(r#"export const x = { "name": "Detect" };"#, "detect.js")
            .unwrap_err();
        match err {
            ExtractError::MissingKey { key, .. } => assert_eq!(key, "techniques"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_technique_without_id_fails() {
        let src = r#"export const x = { "name": "Detect", "techniques": [{ "name": "No id" }] };"#;
        assert!(matches!(
            parse_source(src, "detect.js"),
            Err(ExtractError::Malformed { .. })
        ));
    }

    #[test]
    fn test_no_export_object() {
        assert!(matches!(
            parse_source("export const x = 42;", "evict.js"),
            Err(ExtractError::NoObject(_))
        ));
    }

    #[test]
    fn test_plain_json_source() {
        let src = r#"{ "name": "Restore", "techniques": [{ "id": "AID-R-001", "name": "Backups" }] }"#;
        let docs = parse_source(src, "restore.json").unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].tactic, "Restore");
    }

    #[test]
    fn test_braces_inside_strings_do_not_end_object() {
        let src = r#"export const x = { "name": "M}odel", "techniques": [] }; const y = {};"#;
        let docs = parse_source(src, "model.js").unwrap();
        assert!(docs.is_empty());
    }

    #[test]
    fn test_strip_markup() {
        assert_eq!(
            strip_markup("<h5>Concept:</h5>\n<p>a &lt;b&gt;  c</p>"),
            "Concept: a <b> c"
        );
    }
}
