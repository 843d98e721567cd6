//! Query commands: `chk search` (evidence only) and `chk ask` (verdict).

use anyhow::Result;
use uuid::Uuid;

use compliance_harness_core::models::EvidenceItem;
use compliance_harness_core::store::ScopeFilter;
use compliance_harness_core::verdict::ComplianceVerdict;

use crate::app::Harness;
use crate::config::Config;
use crate::engine::AssessRequest;

fn scope_filter(documents: Vec<String>, knowledgebase_id: Option<String>) -> ScopeFilter {
    ScopeFilter {
        document_ids: if documents.is_empty() {
            None
        } else {
            Some(documents)
        },
        knowledgebase_id,
        classes: None,
    }
}

/// Print ranked evidence for `query` without calling the model.
pub async fn run_search(
    config: &Config,
    query: &str,
    documents: Vec<String>,
    knowledgebase_id: Option<String>,
    top_k: Option<usize>,
) -> Result<()> {
    if query.trim().is_empty() {
        anyhow::bail!("query must not be empty");
    }
    let harness = Harness::open_without_llm(config).await?;
    let query_id = Uuid::new_v4().to_string();
    let evidence = harness
        .retriever
        .retrieve(
            &query_id,
            query,
            top_k,
            scope_filter(documents, knowledgebase_id),
        )
        .await?;

    if evidence.is_empty() {
        println!("No evidence above min_similarity {}.", config.retrieval.min_similarity);
        return Ok(());
    }
    for (i, item) in evidence.iter().enumerate() {
        print_evidence(i + 1, item);
    }
    Ok(())
}

fn print_evidence(rank: usize, item: &EvidenceItem) {
    let location = match (&item.clause_number, &item.section_label) {
        (Some(c), _) => format!("clause {}", c),
        (None, Some(s)) => s.clone(),
        (None, None) => "-".to_string(),
    };
    println!(
        "{}. [{:.3}] {} ({}) {}",
        rank,
        item.similarity,
        item.document_name,
        item.document_class.authority_label(),
        location
    );
    let snippet: String = item.text.chars().take(200).collect();
    println!("    {}", snippet.replace('\n', " "));
}

/// Run a full compliance assessment and print the verdict.
pub async fn run_ask(
    config: &Config,
    query: &str,
    scope: Option<String>,
    documents: Vec<String>,
    knowledgebase_id: Option<String>,
    json: bool,
) -> Result<()> {
    if query.trim().is_empty() {
        anyhow::bail!("query must not be empty");
    }
    let harness = Harness::open(config).await?;
    let request = AssessRequest {
        scope,
        filter: scope_filter(documents, knowledgebase_id),
        ..AssessRequest::new(query)
    };

    let assessment = match harness.engine.assess(request).await {
        Ok(a) => a,
        Err(e) => {
            tracing::error!(error = %e, "assessment failed");
            anyhow::bail!(e.user_message());
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&assessment)?);
    } else {
        print_verdict(&assessment.verdict);
        println!();
        println!(
            "  query id: {}  scope: {} (prompt v{})",
            assessment.query_id, assessment.scope, assessment.prompt_version
        );
    }
    Ok(())
}

fn print_verdict(v: &ComplianceVerdict) {
    println!("Status:      {}", v.status);
    println!("Confidence:  {:.2}", v.confidence_score);
    println!();
    println!("{}", v.summary);

    if !v.analysis.is_empty() {
        println!();
        println!("Analysis:");
        for p in &v.analysis {
            let cite = match (&p.document_name, &p.clause_reference) {
                (Some(d), Some(c)) => format!(" [{} §{}]", d, c),
                (Some(d), None) => format!(" [{}]", d),
                _ => String::new(),
            };
            println!("  - {}{}", p.point, cite);
        }
    }
    if !v.violations.is_empty() {
        println!();
        println!("Violations:");
        for x in &v.violations {
            println!("  - {}: {}", x.what, x.why);
        }
    }
    if !v.recommendations.is_empty() {
        println!();
        println!("Recommendations:");
        for r in &v.recommendations {
            println!("  - ({:?}) {}", r.priority, r.recommendation);
        }
    }
    if !v.source_documents.is_empty() {
        println!();
        println!("Sources:");
        for s in &v.source_documents {
            println!("  - {} ({})", s.document_name, s.document_class);
        }
    }
    println!();
    println!("{}", v.disclaimer);
}
