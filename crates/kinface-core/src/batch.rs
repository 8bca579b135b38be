//! Similarity analysis over a set of labelled embeddings.

use serde::{Deserialize, Serialize};

use crate::error::AnalysisError;
use crate::similarity::cosine_similarity;

/// Minimum number of embeddings a batch analysis needs.
pub const MIN_BATCH_FACES: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchMode {
    SimilarityMatrix,
    FindBestMatch,
    GroupSimilar,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarityMatrix {
    /// Row/column `i` belongs to `image_ids[i]`.
    pub matrix: Vec<Vec<f32>>,
    pub image_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestMatch {
    pub source_id: String,
    pub target_id: String,
    pub similarity: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceGroup {
    pub group_id: usize,
    pub members: Vec<String>,
    /// Mean similarity over every member pair.
    pub avg_similarity: f32,
}

/// Result of [`analyze`], keyed by the kind of analysis in JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchOutcome {
    SimilarityMatrix(SimilarityMatrix),
    BestMatches(Vec<BestMatch>),
    Groups(Vec<FaceGroup>),
}

/// Run one analysis over `(id, embedding)` pairs, in input order.
pub fn analyze(
    mode: BatchMode,
    entries: &[(String, Vec<f32>)],
    threshold: f32,
) -> Result<BatchOutcome, AnalysisError> {
    if entries.len() < MIN_BATCH_FACES {
        return Err(AnalysisError::InvalidInput(format!(
            "at least {MIN_BATCH_FACES} valid face images are required, got {}",
            entries.len()
        )));
    }

    let outcome = match mode {
        BatchMode::SimilarityMatrix => BatchOutcome::SimilarityMatrix(similarity_matrix(entries)?),
        BatchMode::FindBestMatch => BatchOutcome::BestMatches(find_best_matches(entries, threshold)?),
        BatchMode::GroupSimilar => BatchOutcome::Groups(group_similar(entries, threshold)?),
    };

    tracing::debug!(?mode, faces = entries.len(), threshold, "batch analysis complete");
    Ok(outcome)
}

/// Pairwise cosine similarities. The diagonal is exactly 1.0.
fn pairwise(entries: &[(String, Vec<f32>)]) -> Result<Vec<Vec<f32>>, AnalysisError> {
    let n = entries.len();
    let mut matrix = vec![vec![1.0f32; n]; n];
    for i in 0..n {
        for j in (i + 1)..n {
            let sim = cosine_similarity(&entries[i].1, &entries[j].1)?;
            matrix[i][j] = sim;
            matrix[j][i] = sim;
        }
    }
    Ok(matrix)
}

pub fn similarity_matrix(entries: &[(String, Vec<f32>)]) -> Result<SimilarityMatrix, AnalysisError> {
    Ok(SimilarityMatrix {
        matrix: pairwise(entries)?,
        image_ids: entries.iter().map(|(id, _)| id.clone()).collect(),
    })
}

/// For each id, the most similar other id at or above `threshold`.
///
/// Ties keep the earlier candidate. Ids with no qualifying partner are omitted.
pub fn find_best_matches(
    entries: &[(String, Vec<f32>)],
    threshold: f32,
) -> Result<Vec<BestMatch>, AnalysisError> {
    let matrix = pairwise(entries)?;

    let matches = matrix
        .iter()
        .enumerate()
        .filter_map(|(i, row)| {
            let mut best: Option<(usize, f32)> = None;
            for (j, &sim) in row.iter().enumerate() {
                if i == j || sim < threshold {
                    continue;
                }
                if best.map_or(true, |(_, best_sim)| sim > best_sim) {
                    best = Some((j, sim));
                }
            }
            best.map(|(j, similarity)| BestMatch {
                source_id: entries[i].0.clone(),
                target_id: entries[j].0.clone(),
                similarity,
            })
        })
        .collect();

    Ok(matches)
}

/// Greedy grouping around seeds.
///
/// Each unvisited id in order becomes a seed and absorbs every unvisited id
/// whose similarity *to the seed* reaches `threshold`. Members are not
/// compared with each other, so groups are not transitive closures.
/// Singletons are dropped.
pub fn group_similar(
    entries: &[(String, Vec<f32>)],
    threshold: f32,
) -> Result<Vec<FaceGroup>, AnalysisError> {
    let matrix = pairwise(entries)?;
    let n = entries.len();
    let mut visited = vec![false; n];
    let mut groups = Vec::new();

    for seed in 0..n {
        if visited[seed] {
            continue;
        }
        visited[seed] = true;
        let mut members = vec![seed];

        for candidate in 0..n {
            if !visited[candidate] && matrix[seed][candidate] >= threshold {
                visited[candidate] = true;
                members.push(candidate);
            }
        }

        if members.len() < 2 {
            continue;
        }

        let mut total = 0.0f32;
        let mut pairs = 0usize;
        for (k, &a) in members.iter().enumerate() {
            for &b in &members[k + 1..] {
                total += matrix[a][b];
                pairs += 1;
            }
        }

        groups.push(FaceGroup {
            group_id: groups.len(),
            members: members.iter().map(|&m| entries[m].0.clone()).collect(),
            avg_similarity: total / pairs as f32,
        });
    }

    Ok(groups)
}
