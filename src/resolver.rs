//! Iterative resolution engine.
//!
//! Transforms a client question into a terminal result by walking the
//! delegation chain: cache first, then root hints, following referrals and
//! CNAME redirections until an authoritative answer is obtained or the chain
//! cannot proceed. Hops within one resolution are strictly sequential.
//!
//! The walk is driven as an explicit state machine with an explicit hop
//! counter, so the hop-limit and retry-budget bounds are visible in one
//! place rather than buried in nested loops.

use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt};
use log::debug;

use crate::cache::DnsCache;
use crate::config::ResolverConfig;
use crate::dns::{Question, RecordData, RecordType, ResourceRecord, ParsedReply, RCODE_NOERROR};
use crate::hints::RootHints;
use crate::transport::{self, QueryOutcome};

/// Why a resolution failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// Every attempt against the delegation chain timed out.
    TimeoutExhausted,

    /// The chain ended without an answer or a further delegation,
    /// or the hop limit was reached.
    NoDelegation,

    /// Every attempt produced an unparseable reply.
    MalformedReply,

    /// The candidate servers could not be reached.
    ServerUnreachable,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::TimeoutExhausted => write!(f, "timeout-exhausted"),
            FailureReason::NoDelegation => write!(f, "no-delegation-found"),
            FailureReason::MalformedReply => write!(f, "malformed-reply"),
            FailureReason::ServerUnreachable => write!(f, "server-unreachable"),
        }
    }
}

/// Terminal outcome of one client query.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionResult {
    Answered(Vec<ResourceRecord>),
    Failed(FailureReason),
}

/// What one upstream attempt produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HopOutcome {
    Answer,
    Referral,
    Cname,
    Negative,
    TimedOut,
    Unreachable,
    Malformed,
}

impl fmt::Display for HopOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HopOutcome::Answer => write!(f, "answer"),
            HopOutcome::Referral => write!(f, "referral"),
            HopOutcome::Cname => write!(f, "cname"),
            HopOutcome::Negative => write!(f, "negative"),
            HopOutcome::TimedOut => write!(f, "timeout"),
            HopOutcome::Unreachable => write!(f, "unreachable"),
            HopOutcome::Malformed => write!(f, "malformed"),
        }
    }
}

/// One upstream attempt, recorded for the query log.
#[derive(Debug, Clone)]
pub struct TraceHop {
    pub server: SocketAddr,
    pub outcome: HopOutcome,
    pub rtt: Duration,
}

/// A finished resolution: the result plus everything the log writer needs.
#[derive(Debug)]
pub struct Resolution {
    pub result: ResolutionResult,
    pub trace: Vec<TraceHop>,
    pub cache_hit: bool,
    pub elapsed: Duration,
}

/// States of the resolution walk.
enum Step {
    CacheCheck,
    Querying {
        servers: Vec<SocketAddr>,
        index: usize,
        attempt: u32,
    },
    Referred {
        servers: Vec<SocketAddr>,
    },
    Redirected {
        target: String,
    },
    Done(ResolutionResult),
}

/// How a valid reply advances the walk.
enum Classified {
    Answer(Vec<ResourceRecord>, u32),
    Cname(String),
    Referral {
        ns_names: Vec<String>,
        glue: Vec<SocketAddr>,
    },
    Negative,
}

/// The iterative resolution engine.
///
/// Shared across all in-flight queries; holds the cache and root hints plus
/// the bounds that keep every resolution finite.
pub struct Resolver {
    cache: Arc<DnsCache>,
    hints: Arc<RootHints>,
    hop_limit: u32,
    retry_budget: u32,
    query_timeout: Duration,
    upstream_port: u16,
}

impl Resolver {
    pub fn new(config: &ResolverConfig, cache: Arc<DnsCache>, hints: Arc<RootHints>) -> Self {
        Self {
            cache,
            hints,
            hop_limit: config.hop_limit,
            retry_budget: config.retry_budget.max(1),
            query_timeout: config.query_timeout,
            upstream_port: config.upstream_port,
        }
    }

    /// Resolve one question to a terminal result.
    ///
    /// Never returns an error: every per-query failure is folded into
    /// `ResolutionResult::Failed`.
    pub async fn resolve(&self, question: Question) -> Resolution {
        let started = Instant::now();
        debug!("Resolving {} {}", question.name, question.qtype);

        let original = question.name.clone();
        let mut trace = Vec::new();
        let (result, cache_hit) = self
            .resolve_inner(question, original, &mut trace, 0)
            .await;

        Resolution {
            result,
            trace,
            cache_hit,
            elapsed: started.elapsed(),
        }
    }

    /// Drive the state machine for one (possibly nested) resolution.
    ///
    /// `depth` counts nested lookups of glueless nameservers; the trace is
    /// shared so nested hops show up in the query log. Boxed because
    /// glueless referrals recurse.
    fn resolve_inner<'a>(
        &'a self,
        question: Question,
        original: String,
        trace: &'a mut Vec<TraceHop>,
        depth: u32,
    ) -> BoxFuture<'a, (ResolutionResult, bool)> {
        async move {
            if depth >= self.hop_limit {
                return (ResolutionResult::Failed(FailureReason::NoDelegation), false);
            }

            let mut question = question;
            let mut seen_cnames: HashSet<String> = HashSet::new();
            let mut hops: u32 = 0;
            let mut timeouts: u32 = 0;
            let mut malformed: u32 = 0;
            let mut failures: u32 = 0;
            let mut initial = true;
            let mut cache_hit = false;
            let mut step = Step::CacheCheck;

            loop {
                step = match step {
                    Step::CacheCheck => {
                        let first = initial;
                        initial = false;
                        if let Some(records) = self.cache.lookup(&question) {
                            debug!("Cache hit for {} {}", question.name, question.qtype);
                            if first {
                                cache_hit = true;
                            }
                            Step::Done(ResolutionResult::Answered(records))
                        } else {
                            Step::Querying {
                                servers: self.hints.roots().to_vec(),
                                index: 0,
                                attempt: 1,
                            }
                        }
                    }

                    Step::Querying { servers, index, attempt } => {
                        if index >= servers.len() {
                            let reason = if failures > 0 && timeouts == failures {
                                FailureReason::TimeoutExhausted
                            } else if failures > 0 && malformed == failures {
                                FailureReason::MalformedReply
                            } else {
                                FailureReason::ServerUnreachable
                            };
                            Step::Done(ResolutionResult::Failed(reason))
                        } else {
                            let server = servers[index];
                            let attempt_started = Instant::now();
                            let outcome =
                                transport::query(&question, server, self.query_timeout).await;
                            let rtt = attempt_started.elapsed();

                            match outcome {
                                QueryOutcome::Reply(reply) => match self.classify(&question, &reply) {
                                    Classified::Answer(records, ttl) => {
                                        trace.push(TraceHop { server, outcome: HopOutcome::Answer, rtt });
                                        debug!("Answer for {} from {} (ttl {})", question.name, server, ttl);
                                        self.cache.insert(
                                            question.clone(),
                                            records.clone(),
                                            Duration::from_secs(u64::from(ttl)),
                                        );
                                        Step::Done(ResolutionResult::Answered(records))
                                    }
                                    Classified::Cname(target) => {
                                        trace.push(TraceHop { server, outcome: HopOutcome::Cname, rtt });
                                        hops += 1;
                                        if hops >= self.hop_limit {
                                            Step::Done(ResolutionResult::Failed(FailureReason::NoDelegation))
                                        } else {
                                            Step::Redirected { target }
                                        }
                                    }
                                    Classified::Referral { ns_names, glue } => {
                                        trace.push(TraceHop { server, outcome: HopOutcome::Referral, rtt });
                                        hops += 1;
                                        if hops >= self.hop_limit {
                                            debug!("Hop limit reached for {}", question.name);
                                            Step::Done(ResolutionResult::Failed(FailureReason::NoDelegation))
                                        } else if !glue.is_empty() {
                                            debug!("Delegation for {} to {:?}", question.name, glue);
                                            Step::Referred { servers: glue }
                                        } else {
                                            self.follow_glueless(&ns_names[0], &original, trace, depth).await
                                        }
                                    }
                                    Classified::Negative => {
                                        trace.push(TraceHop { server, outcome: HopOutcome::Negative, rtt });
                                        debug!(
                                            "No answer and no delegation for {} from {}",
                                            question.name, server
                                        );
                                        Step::Done(ResolutionResult::Failed(FailureReason::NoDelegation))
                                    }
                                },
                                QueryOutcome::TimedOut => {
                                    debug!("Timeout from {} for {}", server, question.name);
                                    trace.push(TraceHop { server, outcome: HopOutcome::TimedOut, rtt });
                                    timeouts += 1;
                                    failures += 1;
                                    next_attempt(servers, index, attempt, self.retry_budget)
                                }
                                QueryOutcome::Unreachable => {
                                    debug!("Server {} unreachable for {}", server, question.name);
                                    trace.push(TraceHop { server, outcome: HopOutcome::Unreachable, rtt });
                                    failures += 1;
                                    next_attempt(servers, index, attempt, self.retry_budget)
                                }
                                QueryOutcome::Malformed => {
                                    debug!("Malformed reply from {} for {}", server, question.name);
                                    trace.push(TraceHop { server, outcome: HopOutcome::Malformed, rtt });
                                    malformed += 1;
                                    failures += 1;
                                    next_attempt(servers, index, attempt, self.retry_budget)
                                }
                            }
                        }
                    }

                    Step::Referred { servers } => Step::Querying { servers, index: 0, attempt: 1 },

                    Step::Redirected { target } => {
                        if target == question.name || !seen_cnames.insert(target.clone()) {
                            debug!("CNAME loop at {}", target);
                            Step::Done(ResolutionResult::Failed(FailureReason::NoDelegation))
                        } else {
                            debug!("Following CNAME to {}", target);
                            question = Question { name: target, qtype: question.qtype };
                            Step::CacheCheck
                        }
                    }

                    Step::Done(result) => return (result, cache_hit),
                };
            }
        }
        .boxed()
    }

    /// A referral came back without glue: resolve the nameserver's own
    /// address with a nested lookup before continuing the walk.
    async fn follow_glueless(
        &self,
        ns_name: &str,
        original: &str,
        trace: &mut Vec<TraceHop>,
        depth: u32,
    ) -> Step {
        if ns_name == original {
            // Delegation points at the name being resolved and carries no
            // glue; there is no address to make progress with.
            debug!("Self-referential delegation to {} without glue", ns_name);
            return Step::Done(ResolutionResult::Failed(FailureReason::NoDelegation));
        }

        debug!("Resolving glueless nameserver {}", ns_name);
        let ns_question = Question { name: ns_name.to_string(), qtype: RecordType::A };
        let (result, _) = self
            .resolve_inner(ns_question, original.to_string(), &mut *trace, depth + 1)
            .await;

        match result {
            ResolutionResult::Answered(records) => {
                let servers: Vec<SocketAddr> = records
                    .iter()
                    .filter_map(|record| match record.data {
                        RecordData::A(ip) => {
                            Some(SocketAddr::new(IpAddr::V4(ip), self.upstream_port))
                        }
                        _ => None,
                    })
                    .collect();
                if servers.is_empty() {
                    Step::Done(ResolutionResult::Failed(FailureReason::NoDelegation))
                } else {
                    Step::Referred { servers }
                }
            }
            ResolutionResult::Failed(_) => {
                debug!("Failed to resolve nameserver {}", ns_name);
                Step::Done(ResolutionResult::Failed(FailureReason::NoDelegation))
            }
        }
    }

    /// Classify a valid reply against the current question.
    fn classify(&self, question: &Question, reply: &ParsedReply) -> Classified {
        let matching: Vec<ResourceRecord> = reply
            .answers
            .iter()
            .filter(|record| record.rtype == question.qtype)
            .cloned()
            .collect();
        if !matching.is_empty() {
            let ttl = matching.iter().map(|record| record.ttl).min().unwrap_or(0);
            return Classified::Answer(matching, ttl);
        }

        if question.qtype != RecordType::Cname {
            let cname = reply
                .answers
                .iter()
                .find(|record| record.rtype == RecordType::Cname && record.name == question.name)
                .or_else(|| reply.answers.iter().find(|record| record.rtype == RecordType::Cname));
            if let Some(record) = cname {
                if let RecordData::Cname(target) = &record.data {
                    return Classified::Cname(target.clone());
                }
            }
        }

        if reply.rcode == RCODE_NOERROR {
            let ns_names: Vec<String> = reply
                .authorities
                .iter()
                .filter_map(|record| match &record.data {
                    RecordData::Ns(target) => Some(target.clone()),
                    _ => None,
                })
                .collect();
            if !ns_names.is_empty() {
                let glue: Vec<SocketAddr> = reply
                    .additionals
                    .iter()
                    .filter_map(|record| match &record.data {
                        RecordData::A(ip) if ns_names.contains(&record.name) => {
                            Some(SocketAddr::new(IpAddr::V4(*ip), self.upstream_port))
                        }
                        _ => None,
                    })
                    .collect();
                return Classified::Referral { ns_names, glue };
            }
        }

        Classified::Negative
    }
}

/// Retry the same server while budget remains, then advance to the next.
fn next_attempt(servers: Vec<SocketAddr>, index: usize, attempt: u32, retry_budget: u32) -> Step {
    if attempt < retry_budget {
        Step::Querying { servers, index, attempt: attempt + 1 }
    } else {
        Step::Querying { servers, index: index + 1, attempt: 1 }
    }
}
