//! Crew job assignment at round start.
//!
//! Assignment runs in passes: candidates whose top choice is an
//! always-allowed job get it outright, minimum crew requirements are filled
//! next (the volunteer who ranked the job highest wins it, conscripting at
//! random when there are none), then remaining candidates walk their
//! preference lists in rank order against job caps, and whoever is still
//! left gets whatever has room. The candidate order is shuffled up front so
//! ties do not favor low client IDs.

use log::warn;
use rand::seq::SliceRandom;
use rand::Rng;

#[derive(Debug, Clone)]
pub struct JobPrefab {
    pub name: String,
    /// Crew slots that must be filled before preferences are honored.
    pub min_number: usize,
    /// Hard cap per round.
    pub max_number: usize,
    /// Jobs that only make sense with a crew of at least this size.
    pub required_players: usize,
    /// Always granted when it is the candidate's first preference,
    /// regardless of caps.
    pub allow_always: bool,
}

/// The default job roster.
pub fn default_jobs() -> Vec<JobPrefab> {
    let job = |name: &str, min, max, required, always| JobPrefab {
        name: name.to_string(),
        min_number: min,
        max_number: max,
        required_players: required,
        allow_always: always,
    };
    vec![
        job("Captain", 1, 1, 0, false),
        job("Engineer", 1, 3, 0, false),
        job("Mechanic", 1, 3, 0, false),
        job("Medical Doctor", 0, 2, 0, false),
        job("Security Officer", 0, 2, 2, false),
        job("Assistant", 0, 16, 0, true),
    ]
}

/// A client waiting for a job, with preferences as indices into the job
/// roster, best first.
#[derive(Debug, Clone)]
pub struct JobCandidate {
    pub client_id: u8,
    pub preferences: Vec<usize>,
}

/// Assigns a job to every candidate. Returns `(client_id, job_index)`
/// pairs; every candidate appears exactly once.
pub fn assign_jobs(
    jobs: &[JobPrefab],
    mut candidates: Vec<JobCandidate>,
    player_count: usize,
    rng: &mut impl Rng,
) -> Vec<(u8, usize)> {
    let mut assigned: Vec<(u8, usize)> = Vec::new();
    let mut counts = vec![0usize; jobs.len()];
    candidates.shuffle(rng);

    // always-allowed jobs picked as a first preference bypass everything
    candidates.retain(|candidate| {
        if let Some(&job_idx) = candidate.preferences.first() {
            if jobs.get(job_idx).map_or(false, |j| j.allow_always) {
                counts[job_idx] += 1;
                assigned.push((candidate.client_id, job_idx));
                return false;
            }
        }
        true
    });

    // fill minimum crew requirements; among volunteers the one who ranked
    // the job highest wins it, conscripts are drawn at random
    let mut progress = true;
    while progress && !candidates.is_empty() {
        progress = false;
        for (job_idx, job) in jobs.iter().enumerate() {
            if counts[job_idx] >= job.min_number || candidates.is_empty() {
                continue;
            }
            let pick = candidates
                .iter()
                .enumerate()
                .filter_map(|(i, c)| {
                    c.preferences
                        .iter()
                        .position(|&p| p == job_idx)
                        .map(|rank| (rank, i))
                })
                .min_by_key(|&(rank, _)| rank)
                .map(|(_, i)| i)
                .unwrap_or_else(|| rng.gen_range(0..candidates.len()));
            let candidate = candidates.swap_remove(pick);
            counts[job_idx] += 1;
            assigned.push((candidate.client_id, job_idx));
            progress = true;
        }
    }

    // preference walk, best rank first
    let deepest = candidates
        .iter()
        .map(|c| c.preferences.len())
        .max()
        .unwrap_or(0);
    for rank in 0..deepest {
        candidates.retain(|candidate| {
            if let Some(&job_idx) = candidate.preferences.get(rank) {
                if let Some(job) = jobs.get(job_idx) {
                    // players already holding the job no longer count
                    // toward its crew-size requirement
                    if counts[job_idx] < job.max_number
                        && player_count.saturating_sub(counts[job_idx]) >= job.required_players
                    {
                        counts[job_idx] += 1;
                        assigned.push((candidate.client_id, job_idx));
                        return false;
                    }
                }
            }
            true
        });
    }

    // whatever has room; an over-cap random pick is the last resort
    for candidate in candidates {
        let open: Vec<usize> = jobs
            .iter()
            .enumerate()
            .filter(|(i, job)| {
                counts[*i] < job.max_number
                    && player_count.saturating_sub(counts[*i]) >= job.required_players
            })
            .map(|(i, _)| i)
            .collect();
        let job_idx = match open.choose(rng) {
            Some(&idx) => idx,
            None => {
                let idx = rng.gen_range(0..jobs.len());
                warn!(
                    "No job with open slots for client {}, over-assigning {}",
                    candidate.client_id, jobs[idx].name
                );
                idx
            }
        };
        counts[job_idx] += 1;
        assigned.push((candidate.client_id, job_idx));
    }

    assigned
}
