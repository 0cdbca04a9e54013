use serde::Serialize;
use std::collections::HashSet;

/// Where a question gets routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryKind {
    DataQuery,
    GeneralKnowledge,
}

/// Definitional/general phrasing routes straight to the general model.
const GENERAL_PHRASES: &[&str] = &[
    "what is",
    "explain",
    "tell me about",
    "define",
    "difference between",
    "how does",
    "what are",
    "who is",
    "why is",
    "when is",
    "where is",
    "describe",
    "meaning of",
    "tell me a joke",
    "capital of",
    "weather",
];

/// Retrieval/aggregation phrasing routes to the SQL pipeline.
const DATA_PHRASES: &[&str] = &[
    "how many",
    "count",
    "total",
    "shipment",
    "account",
    "order",
    "list",
    "show",
    "find",
    "status",
    "date",
    "origin",
    "destination",
    "delayed",
    "region",
    "average",
    "sum",
    "max",
    "min",
    "group by",
    "filter by",
    "top",
];

/// Routes a question without any model round trip. General phrasing wins
/// first, then data phrasing; an ambiguous question becomes a data query
/// only when it shares vocabulary with the schema.
pub fn classify(question: &str, schema_terms: &HashSet<String>) -> QueryKind {
    let lowered = question.to_lowercase();

    if GENERAL_PHRASES.iter().any(|p| lowered.contains(p)) {
        return QueryKind::GeneralKnowledge;
    }

    if DATA_PHRASES.iter().any(|p| lowered.contains(p)) {
        return QueryKind::DataQuery;
    }

    let overlaps_schema = lowered
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|token| token.len() > 1)
        .any(|token| schema_terms.contains(token));

    if overlaps_schema {
        QueryKind::DataQuery
    } else {
        QueryKind::GeneralKnowledge
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shipping_terms() -> HashSet<String> {
        ["shipment", "courier", "cost", "delivery", "account"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn aggregation_questions_are_data_queries() {
        let kind = classify(
            "How many shipments were made in July 2025?",
            &shipping_terms(),
        );
        assert_eq!(kind, QueryKind::DataQuery);
    }

    #[test]
    fn definitional_questions_are_general_knowledge() {
        let kind = classify("What is supply chain management?", &shipping_terms());
        assert_eq!(kind, QueryKind::GeneralKnowledge);
    }

    #[test]
    fn ambiguous_question_with_schema_overlap_goes_to_data() {
        // No general or data phrase, but "courier" is a schema term.
        let kind = classify("fastest courier this year?", &shipping_terms());
        assert_eq!(kind, QueryKind::DataQuery);
    }

    #[test]
    fn ambiguous_question_without_overlap_goes_to_general() {
        let kind = classify("any plans for the weekend?", &shipping_terms());
        assert_eq!(kind, QueryKind::GeneralKnowledge);
    }

    #[test]
    fn general_phrasing_wins_over_schema_overlap() {
        let kind = classify("Explain what a shipment manifest is", &shipping_terms());
        assert_eq!(kind, QueryKind::GeneralKnowledge);
    }

    #[test]
    fn empty_schema_terms_still_classify() {
        let empty = HashSet::new();
        assert_eq!(classify("how many orders shipped", &empty), QueryKind::DataQuery);
        assert_eq!(classify("hello there", &empty), QueryKind::GeneralKnowledge);
    }
}
