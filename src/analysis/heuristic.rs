//! Rule-driven analyzer
//!
//! Each rule names a target attribute and the values that count as a
//! stereotyped rendering, optionally only when a condition attribute holds.
//! A rule is *considered* when its condition holds and its target is
//! present; confidence is matched / considered.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::schema::types::{AttributeValue, TypedAttributeMap};
use crate::types::AnalysisType;

use super::traits::{AnalysisFinding, AnalysisRequest, BiasAnalyzer};

/// Attribute test: `path` holds a value containing any of `any_of`
///
/// An empty `any_of` matches any present value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeMatch {
    pub path: String,
    #[serde(default)]
    pub any_of: Vec<String>,
}

impl AttributeMatch {
    pub fn new(path: &str, any_of: &[&str]) -> Self {
        Self {
            path: path.to_string(),
            any_of: any_of.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn present(&self, attributes: &TypedAttributeMap) -> bool {
        attributes.contains_key(&self.path)
    }

    fn matches(&self, attributes: &TypedAttributeMap) -> bool {
        let Some(value) = attributes.get(&self.path) else {
            return false;
        };
        if self.any_of.is_empty() {
            return true;
        }
        let texts: Vec<Vec<String>> = value_texts(value).iter().map(|t| words(t)).collect();
        self.any_of.iter().any(|needle| {
            let needle = words(needle);
            !needle.is_empty()
                && texts
                    .iter()
                    .any(|t| t.windows(needle.len()).any(|w| w == needle.as_slice()))
        })
    }
}

/// One stereotype indicator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorRule {
    pub analysis: AnalysisType,
    pub indicator: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<AttributeMatch>,
    pub target: AttributeMatch,
}

impl IndicatorRule {
    fn considered(&self, attributes: &TypedAttributeMap) -> bool {
        self.when.as_ref().map_or(true, |w| w.matches(attributes))
            && self.target.present(attributes)
    }
}

/// Lowercase words, so "male" never matches inside "female"
fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn value_texts(value: &AttributeValue) -> Vec<String> {
    match value {
        AttributeValue::Text(s) => vec![s.clone()],
        AttributeValue::TextList(items) => items.clone(),
        AttributeValue::Number(n) => vec![n.to_string()],
        AttributeValue::Boolean(b) => vec![b.to_string()],
    }
}

/// Built-in indicator rules
pub fn default_rules() -> Vec<IndicatorRule> {
    use AnalysisType::*;

    let female = Some(AttributeMatch::new("gender", &["female", "woman", "girl"]));
    let male = Some(AttributeMatch::new("gender", &["male", "man", "boy"]));
    let senior = Some(AttributeMatch::new("age", &["senior", "elderly", "old"]));
    let young = Some(AttributeMatch::new("age", &["young", "teen", "child"]));
    let any_ethnicity = Some(AttributeMatch::new("ethnicity", &[]));

    let rule = |analysis, indicator: &str, when: &Option<AttributeMatch>, target| IndicatorRule {
        analysis,
        indicator: indicator.to_string(),
        when: when.clone(),
        target,
    };

    vec![
        rule(
            GenderStereotype,
            "female persona in stereotypically feminine clothing",
            &female,
            AttributeMatch::new("clothing.style", &["dress", "skirt", "pink", "frilly"]),
        ),
        rule(
            GenderStereotype,
            "female persona with a demure expression",
            &female,
            AttributeMatch::new("expression", &["shy", "demure", "coy"]),
        ),
        rule(
            GenderStereotype,
            "male persona with an exaggerated muscular build",
            &male,
            AttributeMatch::new("body.build", &["muscular", "bulky"]),
        ),
        rule(
            AgeStereotype,
            "older persona rendered frail",
            &senior,
            AttributeMatch::new("body.build", &["frail", "weak"]),
        ),
        rule(
            AgeStereotype,
            "older persona rendered stooped",
            &senior,
            AttributeMatch::new("posture", &["hunched", "stooped"]),
        ),
        rule(
            AgeStereotype,
            "younger persona reduced to gadgets",
            &young,
            AttributeMatch::new("accessories", &["phone", "headphones", "game"]),
        ),
        rule(
            CulturalStereotype,
            "ethnicity paired with traditional costume",
            &any_ethnicity,
            AttributeMatch::new("clothing.style", &["traditional", "tribal", "ethnic", "folk"]),
        ),
        rule(
            CulturalStereotype,
            "ethnicity paired with ceremonial accessories",
            &any_ethnicity,
            AttributeMatch::new("accessories", &["headdress", "turban", "sombrero", "kimono"]),
        ),
        rule(
            OccupationalStereotype,
            "female persona in a care or service uniform",
            &female,
            AttributeMatch::new("clothing.items", &["apron", "nurse", "maid"]),
        ),
        rule(
            OccupationalStereotype,
            "male persona in executive or manual-labour gear",
            &male,
            AttributeMatch::new("clothing.items", &["suit", "hard hat", "hi-vis", "tie"]),
        ),
    ]
}

/// Analyzer that evaluates [`IndicatorRule`]s locally
#[derive(Debug, Clone)]
pub struct HeuristicAnalyzer {
    rules: Vec<IndicatorRule>,
}

impl Default for HeuristicAnalyzer {
    fn default() -> Self {
        Self::new(default_rules())
    }
}

impl HeuristicAnalyzer {
    pub fn new(rules: Vec<IndicatorRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[IndicatorRule] {
        &self.rules
    }

    /// Evaluate the rules for one analysis type
    pub fn evaluate(
        &self,
        analysis: AnalysisType,
        attributes: &TypedAttributeMap,
    ) -> AnalysisFinding {
        let considered: Vec<&IndicatorRule> = self
            .rules
            .iter()
            .filter(|r| r.analysis == analysis && r.considered(attributes))
            .collect();
        if considered.is_empty() {
            return AnalysisFinding::none();
        }

        let indicators: Vec<String> = considered
            .iter()
            .filter(|r| r.target.matches(attributes))
            .map(|r| r.indicator.clone())
            .collect();

        AnalysisFinding {
            detected: !indicators.is_empty(),
            confidence: indicators.len() as f64 / considered.len() as f64,
            indicators,
        }
    }
}

#[async_trait]
impl BiasAnalyzer for HeuristicAnalyzer {
    fn name(&self) -> &str {
        "heuristic"
    }

    fn supports(&self, analysis: AnalysisType) -> bool {
        self.rules.iter().any(|r| r.analysis == analysis)
    }

    async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisFinding> {
        let finding = self.evaluate(request.analysis, &request.attributes);
        debug!(
            job = %request.job_id,
            analysis = %request.analysis,
            detected = finding.detected,
            confidence = finding.confidence,
            "Heuristic analysis done"
        );
        Ok(finding)
    }
}
