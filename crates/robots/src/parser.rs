use std::time::Duration;

/// Disallow/Allow rules selected for one user-agent, plus any crawl-delay.
/// Matching is longest-prefix; Allow wins ties on equal-length match.
#[derive(Debug, Clone, Default)]
pub struct Ruleset {
    pub disallow: Vec<String>,
    pub allow: Vec<String>,
    pub crawl_delay: Option<Duration>,
}

impl Ruleset {
    pub fn is_allowed(&self, path_and_query: &str) -> bool {
        let disallow_len = longest_match(&self.disallow, path_and_query);
        let allow_len = longest_match(&self.allow, path_and_query);
        if disallow_len == 0 {
            return true;
        }
        allow_len >= disallow_len
    }
}

fn longest_match(patterns: &[String], path: &str) -> usize {
    patterns
        .iter()
        .filter(|p| !p.is_empty() && path.starts_with(p.as_str()))
        .map(|p| p.len())
        .max()
        .unwrap_or(0)
}

/// Parses a robots.txt body, selecting the section for `agent` with exact
/// match preferred over `*`.
pub fn parse(body: &str, agent: &str) -> Ruleset {
    let agent_lower = agent.to_lowercase();
    let mut exact_rules: Option<Ruleset> = None;
    let mut wildcard_rules: Option<Ruleset> = None;

    let mut current_agents: Vec<String> = Vec::new();
    let mut current_disallow: Vec<String> = Vec::new();
    let mut current_allow: Vec<String> = Vec::new();
    let mut current_delay: Option<Duration> = None;
    let mut block_matches_exact = false;
    let mut block_matches_wildcard = false;

    let flush = |agents: &mut Vec<String>,
                 disallow: &mut Vec<String>,
                 allow: &mut Vec<String>,
                 delay: &mut Option<Duration>,
                 matches_exact: &mut bool,
                 matches_wildcard: &mut bool,
                 exact_rules: &mut Option<Ruleset>,
                 wildcard_rules: &mut Option<Ruleset>| {
        if *matches_exact {
            let r = exact_rules.get_or_insert_with(Ruleset::default);
            r.disallow.append(disallow);
            r.allow.append(allow);
            if r.crawl_delay.is_none() {
                r.crawl_delay = *delay;
            }
        }
        if *matches_wildcard {
            let r = wildcard_rules.get_or_insert_with(Ruleset::default);
            r.disallow.append(disallow);
            r.allow.append(allow);
            if r.crawl_delay.is_none() {
                r.crawl_delay = *delay;
            }
        }
        agents.clear();
        disallow.clear();
        allow.clear();
        *delay = None;
        *matches_exact = false;
        *matches_wildcard = false;
    };

    for raw_line in body.lines() {
        let line = strip_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim().to_lowercase();
        let value = value.trim();

        match key.as_str() {
            "user-agent" => {
                if !current_disallow.is_empty()
                    || !current_allow.is_empty()
                    || current_delay.is_some()
                {
                    flush(
                        &mut current_agents,
                        &mut current_disallow,
                        &mut current_allow,
                        &mut current_delay,
                        &mut block_matches_exact,
                        &mut block_matches_wildcard,
                        &mut exact_rules,
                        &mut wildcard_rules,
                    );
                }
                current_agents.push(value.to_lowercase());
                if value == "*" {
                    block_matches_wildcard = true;
                } else if value.to_lowercase() == agent_lower {
                    block_matches_exact = true;
                }
            }
            "disallow" => {
                if !value.is_empty() {
                    current_disallow.push(value.to_string());
                } else {
                    // empty Disallow means "allow everything"
                    current_allow.push(String::new());
                }
            }
            "allow" => {
                current_allow.push(value.to_string());
            }
            "crawl-delay" => {
                if let Ok(secs) = value.parse::<f64>() {
                    current_delay = Some(Duration::from_secs_f64(secs));
                }
            }
            _ => {}
        }
    }
    flush(
        &mut current_agents,
        &mut current_disallow,
        &mut current_allow,
        &mut current_delay,
        &mut block_matches_exact,
        &mut block_matches_wildcard,
        &mut exact_rules,
        &mut wildcard_rules,
    );

    exact_rules.or(wildcard_rules).unwrap_or_default()
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_match_wins() {
        let rules = parse("User-agent: *\nDisallow: /test\nAllow: /example", "crawld");
        assert!(!rules.is_allowed("/test"));
        assert!(rules.is_allowed("/example"));
        assert!(rules.is_allowed("/unrelated"));
    }

    #[test]
    fn allow_wins_equal_length_tie() {
        let rules = parse("User-agent: *\nDisallow: /a\nAllow: /a", "crawld");
        assert!(rules.is_allowed("/a"));
    }

    #[test]
    fn exact_agent_preferred_over_wildcard() {
        let body = "User-agent: *\nDisallow: /\n\nUser-agent: crawld\nDisallow: /private\nAllow: /";
        let rules = parse(body, "crawld");
        assert!(rules.is_allowed("/public"));
        assert!(!rules.is_allowed("/private"));
    }

    #[test]
    fn crawl_delay_parsed() {
        let rules = parse("User-agent: *\nCrawl-delay: 5\nDisallow:", "crawld");
        assert_eq!(rules.crawl_delay, Some(Duration::from_secs(5)));
    }
}
