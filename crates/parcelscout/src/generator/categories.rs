use crate::config::CategoryConfig;

const SURNAMES: &[&str] = &[
    "Smith", "Johnson", "Williams", "Brown", "Jones", "Garcia", "Miller", "Davis", "Rodriguez",
    "Martinez", "Hernandez", "Lopez", "Gonzalez", "Wilson", "Anderson", "Thomas", "Taylor",
    "Moore", "Jackson", "Martin", "Lee", "Perez", "Thompson", "White", "Harris", "Sanchez",
    "Clark", "Ramirez", "Lewis", "Robinson", "Walker", "Young", "Allen", "King", "Wright",
    "Scott", "Torres", "Nguyen", "Hill", "Flores", "Green", "Adams", "Nelson", "Baker", "Hall",
    "Rivera", "Campbell", "Mitchell", "Carter", "Roberts",
];

const STREETS: &[&str] = &[
    "Main", "Oak", "Pine", "Maple", "Cedar", "Elm", "Washington", "Lake", "Hill", "Park",
    "Walnut", "Sunset", "Highland", "Ridge", "Church", "Mill", "Spring", "River", "Meadow",
    "Forest", "Willow", "Jefferson", "Lincoln", "Madison", "Franklin", "Jackson", "Cherry",
    "Valley", "Broadway", "Center",
];

const ENTITY_KEYWORDS: &[&str] = &[
    "Trust", "LLC", "Estate", "Church", "Inc", "Partnership", "Family", "Living Trust",
    "Properties", "Holdings", "Investments", "Ministries", "Association", "Revocable",
    "Foundation",
];

fn category(name: &str, weight: u32, terms: &[&str]) -> CategoryConfig {
    CategoryConfig {
        name: name.to_string(),
        weight,
        terms: terms.iter().map(|t| t.to_string()).collect(),
    }
}

/// The built-in weighted term categories.
pub fn default_categories() -> Vec<CategoryConfig> {
    vec![
        category("surnames", 5, SURNAMES),
        category("streets", 3, STREETS),
        category("entity_keywords", 2, ENTITY_KEYWORDS),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_weights() {
        let categories = default_categories();
        let weights: Vec<_> = categories.iter().map(|c| (c.name.as_str(), c.weight)).collect();
        assert_eq!(
            weights,
            vec![("surnames", 5), ("streets", 3), ("entity_keywords", 2)]
        );
        assert!(categories.iter().all(|c| !c.terms.is_empty()));
    }

    #[test]
    fn test_entity_keywords_present() {
        let entities = &default_categories()[2];
        for keyword in ["Trust", "LLC", "Estate", "Church"] {
            assert!(entities.terms.iter().any(|t| t == keyword));
        }
    }
}
