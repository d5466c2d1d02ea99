pub mod mitre_attack;
