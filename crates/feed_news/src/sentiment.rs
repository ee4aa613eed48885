use core_types::SentimentScorer;

/// Normalisation constant for the compound score, as used by VADER.
const ALPHA: f64 = 15.0;
const NEGATION_SCALAR: f64 = -0.74;
const BOOSTER: f64 = 0.293;

const LEXICON: &[(&str, f64)] = &[
    ("gain", 2.0),
    ("gains", 2.0),
    ("surge", 2.2),
    ("surges", 2.2),
    ("soar", 2.4),
    ("soars", 2.4),
    ("rally", 2.0),
    ("rallies", 2.0),
    ("jump", 1.5),
    ("jumps", 1.5),
    ("rise", 1.3),
    ("rises", 1.3),
    ("beat", 1.4),
    ("beats", 1.4),
    ("record", 1.0),
    ("profit", 1.9),
    ("profits", 1.9),
    ("growth", 1.9),
    ("strong", 2.3),
    ("upgrade", 1.8),
    ("upgrades", 1.8),
    ("bullish", 2.2),
    ("boost", 1.7),
    ("boosts", 1.7),
    ("win", 2.8),
    ("wins", 2.7),
    ("good", 1.9),
    ("great", 3.1),
    ("positive", 2.6),
    ("optimism", 2.5),
    ("recovery", 1.6),
    ("approve", 1.8),
    ("approved", 1.8),
    ("success", 2.7),
    ("fall", -1.5),
    ("falls", -1.5),
    ("drop", -1.3),
    ("drops", -1.3),
    ("slip", -1.1),
    ("slips", -1.1),
    ("plunge", -2.4),
    ("plunges", -2.4),
    ("crash", -2.8),
    ("crashes", -2.8),
    ("slump", -2.1),
    ("loss", -1.3),
    ("losses", -1.7),
    ("weak", -1.9),
    ("miss", -1.2),
    ("misses", -1.2),
    ("downgrade", -1.8),
    ("downgrades", -1.8),
    ("bearish", -2.2),
    ("fear", -2.2),
    ("fears", -2.2),
    ("risk", -1.1),
    ("crisis", -3.1),
    ("fraud", -3.0),
    ("probe", -1.1),
    ("default", -2.0),
    ("bad", -2.5),
    ("negative", -2.7),
    ("concern", -1.4),
    ("concerns", -1.4),
    ("layoffs", -2.0),
    ("penalty", -2.0),
    ("lawsuit", -1.9),
    ("warning", -1.4),
];

const NEGATIONS: &[&str] = &["not", "no", "never", "without", "isn't", "doesn't", "won't", "didn't"];
const BOOSTERS: &[&str] = &["very", "extremely", "sharply", "hugely", "massive", "significantly"];

/// Word-valence scorer with VADER-style negation, boosters and compound
/// normalisation.
#[derive(Debug, Clone, Copy, Default)]
pub struct LexiconSentiment;

impl LexiconSentiment {
    fn valence(word: &str) -> Option<f64> {
        LEXICON
            .iter()
            .find(|(w, _)| *w == word)
            .map(|(_, v)| *v)
    }
}

impl SentimentScorer for LexiconSentiment {
    fn score(&self, text: &str) -> f64 {
        let words = text
            .split(|c: char| !(c.is_alphanumeric() || c == '\''))
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase)
            .collect::<Vec<_>>();

        let mut sum = 0.0;
        for (i, word) in words.iter().enumerate() {
            let Some(mut v) = Self::valence(word) else {
                continue;
            };
            let window = &words[i.saturating_sub(3)..i];
            if window.iter().any(|w| BOOSTERS.contains(&w.as_str())) {
                v += BOOSTER * v.signum();
            }
            if window
                .iter()
                .any(|w| NEGATIONS.contains(&w.as_str()) || w.ends_with("n't"))
            {
                v *= NEGATION_SCALAR;
            }
            sum += v;
        }

        if sum == 0.0 {
            return 0.0;
        }
        (sum / (sum * sum + ALPHA).sqrt()).clamp(-1.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_and_neutral_text_scores_zero() {
        let s = LexiconSentiment;
        assert_eq!(s.score(""), 0.0);
        assert_eq!(s.score("Board meets on Tuesday"), 0.0);
    }

    #[test]
    fn polarity_follows_lexicon() {
        let s = LexiconSentiment;
        assert!(s.score("Reliance shares surge on record profit") > 0.5);
        assert!(s.score("Markets crash as crisis deepens") < -0.5);
    }

    #[test]
    fn negation_flips_and_boosters_amplify() {
        let s = LexiconSentiment;
        assert!(s.score("results not good") < 0.0);
        assert!(s.score("very strong quarter") > s.score("strong quarter"));
    }

    #[test]
    fn compound_stays_in_range() {
        let s = LexiconSentiment;
        let text = "great great great great great great great great great";
        let score = s.score(text);
        assert!(score > 0.9 && score <= 1.0);
    }
}
