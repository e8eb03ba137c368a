use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Room du canal push : groupe de diffusion que les clients rejoignent
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Room {
    Device(String),
    Plant(String),
}

impl Room {
    pub fn device(id: impl Into<String>) -> Self {
        Room::Device(id.into())
    }

    pub fn plant(id: impl Into<String>) -> Self {
        Room::Plant(id.into())
    }

    pub fn is_device(&self) -> bool {
        matches!(self, Room::Device(_))
    }
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Room::Device(id) => write!(f, "device:{id}"),
            Room::Plant(id) => write!(f, "plant:{id}"),
        }
    }
}

impl FromStr for Room {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some(("device", id)) if !id.is_empty() => Ok(Room::Device(id.to_string())),
            Some(("plant", id)) if !id.is_empty() => Ok(Room::Plant(id.to_string())),
            _ => Err(format!("invalid room name: {s}")),
        }
    }
}

/// Cible d'une diffusion : tout le monde, ou les membres d'une room
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Target {
    Global,
    Room(Room),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Global => f.write_str("global"),
            Target::Room(room) => room.fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_names() {
        assert_eq!(Room::device("esp32_04").to_string(), "device:esp32_04");
        assert_eq!(Room::plant("plant-c").to_string(), "plant:plant-c");
        assert_eq!(Target::Global.to_string(), "global");
    }

    #[test]
    fn test_room_parse() {
        assert_eq!("device:esp32_04".parse::<Room>(), Ok(Room::device("esp32_04")));
        assert_eq!("plant:a:b".parse::<Room>(), Ok(Room::plant("a:b")));
        assert!("device:".parse::<Room>().is_err());
        assert!("zone:1".parse::<Room>().is_err());
    }
}
