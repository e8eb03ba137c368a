use serde::{Deserialize, Serialize};

/// Entrée de l'annuaire des usines (issue de la configuration)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlantEntry {
    /// Identifiant utilisé pour la room `plant:<id>`
    pub id: String,
    /// Nom affiché (ex: "Plant C")
    pub name: String,
    /// Fragments de nom de device rattachés à cette usine (ex: "esp32_0", "plant-c")
    #[serde(default)]
    pub device_patterns: Vec<String>,
}

/// Annuaire nom d'usine <-> id, plus la convention de nommage des devices
/// qui permet d'inférer l'usine quand le payload ne la donne pas.
#[derive(Debug, Clone, Default)]
pub struct PlantDirectory {
    entries: Vec<PlantEntry>,
}

impl PlantDirectory {
    pub fn new(entries: Vec<PlantEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[PlantEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Infère le nom d'usine depuis le nom ou l'id du device.
    /// Première entrée dont un pattern est contenu (insensible à la casse) gagne.
    pub fn infer_plant_name(&self, device_id: &str, device_name: &str) -> Option<&str> {
        let id = device_id.to_lowercase();
        let name = device_name.to_lowercase();
        self.entries
            .iter()
            .find(|entry| {
                entry.device_patterns.iter().any(|pattern| {
                    let pattern = pattern.trim().to_lowercase();
                    !pattern.is_empty() && (name.contains(&pattern) || id.contains(&pattern))
                })
            })
            .map(|entry| entry.name.as_str())
    }

    /// Résout l'id d'une usine à partir de son nom (ou de son id directement)
    pub fn plant_id(&self, plant: &str) -> Option<&str> {
        let wanted = plant.trim();
        if wanted.is_empty() {
            return None;
        }
        self.entries
            .iter()
            .find(|entry| entry.name.eq_ignore_ascii_case(wanted) || entry.id.eq_ignore_ascii_case(wanted))
            .map(|entry| entry.id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> PlantDirectory {
        PlantDirectory::new(vec![
            PlantEntry {
                id: "plant-c".into(),
                name: "Plant C".into(),
                device_patterns: vec!["esp32_0".into(), "plantc".into()],
            },
            PlantEntry {
                id: "plant-d".into(),
                name: "Plant D".into(),
                device_patterns: vec!["esp32_1".into()],
            },
        ])
    }

    #[test]
    fn test_infer_from_device_id() {
        let dir = directory();
        assert_eq!(dir.infer_plant_name("esp32_04", ""), Some("Plant C"));
        assert_eq!(dir.infer_plant_name("ESP32_12", ""), Some("Plant D"));
        assert_eq!(dir.infer_plant_name("sensor-9", "boiler room"), None);
    }

    #[test]
    fn test_infer_from_device_name() {
        let dir = directory();
        assert_eq!(dir.infer_plant_name("x", "PlantC gas sensor"), Some("Plant C"));
    }

    #[test]
    fn test_plant_id_lookup() {
        let dir = directory();
        assert_eq!(dir.plant_id("plant c"), Some("plant-c"));
        assert_eq!(dir.plant_id("plant-d"), Some("plant-d"));
        assert_eq!(dir.plant_id("Plant Z"), None);
        assert_eq!(dir.plant_id("  "), None);
    }
}
