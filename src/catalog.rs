use std::io;
use std::path::Path;

use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::info;
use ulid::Ulid;

use crate::engine::EngineError;
use crate::limits::*;
use crate::model::{Car, CarStatus, FleetEvent};
use crate::wal::Wal;

/// What the reservation engine needs to know about cars.
pub trait Catalog: Send + Sync {
    fn get(&self, id: &Ulid) -> Option<Car>;

    /// A car under maintenance or pulled from service is never offered,
    /// whatever its calendar looks like.
    fn is_bookable(&self, car: &Car) -> bool {
        car.status == CarStatus::Available
    }

    fn list(&self) -> Vec<Car>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCar {
    pub make: String,
    pub model: String,
    pub year: i32,
    pub color: String,
    pub license_plate: String,
    pub daily_rate: Decimal,
    pub status: CarStatus,
    pub location: Option<String>,
    pub description: Option<String>,
}

/// Partial update; `None` leaves the field as is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CarChanges {
    pub make: Option<String>,
    pub model: Option<String>,
    pub year: Option<i32>,
    pub color: Option<String>,
    pub license_plate: Option<String>,
    pub daily_rate: Option<Decimal>,
    pub status: Option<CarStatus>,
    pub location: Option<String>,
    pub description: Option<String>,
}

impl CarChanges {
    pub fn is_empty(&self) -> bool {
        *self == CarChanges::default()
    }
}

/// The fleet: every registered car, kept in memory and logged to its own WAL.
///
/// Writes are rare and serialize on the WAL mutex, which also keeps the
/// plate-uniqueness check atomic with the insert.
pub struct Fleet {
    cars: DashMap<Ulid, Car>,
    /// Lowercased licence plate → car id
    plates: DashMap<String, Ulid>,
    wal: Mutex<Wal>,
}

impl Fleet {
    pub fn open(path: &Path) -> io::Result<Self> {
        let events: Vec<FleetEvent> = Wal::replay(path)?;
        let wal = Wal::open(path)?;
        let fleet = Self {
            cars: DashMap::new(),
            plates: DashMap::new(),
            wal: Mutex::new(wal),
        };
        for event in events {
            fleet.apply(event);
        }
        Ok(fleet)
    }

    fn apply(&self, event: FleetEvent) {
        let car = match event {
            FleetEvent::CarRegistered { car } | FleetEvent::CarUpdated { car } => car,
        };
        if let Some(old) = self.cars.get(&car.id).map(|c| plate_key(&c.license_plate)) {
            self.plates.remove(&old);
        }
        self.plates.insert(plate_key(&car.license_plate), car.id);
        self.cars.insert(car.id, car);
    }

    fn persist(&self, wal: &mut Wal, event: FleetEvent) -> Result<(), EngineError> {
        wal.append(&event)
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        self.apply(event);
        Ok(())
    }

    pub async fn register(&self, new: NewCar) -> Result<Car, EngineError> {
        validate_car_fields(
            &new.make,
            &new.model,
            &new.color,
            &new.license_plate,
            new.daily_rate,
            new.location.as_deref(),
            new.description.as_deref(),
        )?;

        let mut wal = self.wal.lock().await;
        if self.cars.len() >= MAX_CARS {
            return Err(EngineError::LimitExceeded("too many cars"));
        }
        if self.plates.contains_key(&plate_key(&new.license_plate)) {
            return Err(EngineError::DuplicateLicensePlate(new.license_plate));
        }

        let now = Utc::now();
        let car = Car {
            id: Ulid::new(),
            make: new.make.trim().to_string(),
            model: new.model.trim().to_string(),
            year: new.year,
            color: new.color.trim().to_string(),
            license_plate: new.license_plate.trim().to_string(),
            daily_rate: new.daily_rate,
            status: new.status,
            location: new.location,
            description: new.description,
            created_at: now,
            updated_at: now,
        };
        self.persist(&mut wal, FleetEvent::CarRegistered { car: car.clone() })?;
        metrics::gauge!(crate::observability::FLEET_SIZE).set(self.cars.len() as f64);
        info!("registered car {} ({})", car.id, car.license_plate);
        Ok(car)
    }

    /// Apply `changes` to a car. A new daily rate only affects quotes and
    /// reservations made afterwards.
    pub async fn update(&self, id: Ulid, changes: CarChanges) -> Result<Car, EngineError> {
        let mut wal = self.wal.lock().await;
        let mut car = self
            .cars
            .get(&id)
            .map(|c| c.value().clone())
            .ok_or(EngineError::CarNotFound(id))?;

        if let Some(make) = changes.make {
            car.make = make.trim().to_string();
        }
        if let Some(model) = changes.model {
            car.model = model.trim().to_string();
        }
        if let Some(year) = changes.year {
            car.year = year;
        }
        if let Some(color) = changes.color {
            car.color = color.trim().to_string();
        }
        if let Some(plate) = changes.license_plate {
            let plate = plate.trim().to_string();
            if let Some(owner) = self.plates.get(&plate_key(&plate))
                && *owner.value() != id
            {
                return Err(EngineError::DuplicateLicensePlate(plate));
            }
            car.license_plate = plate;
        }
        if let Some(rate) = changes.daily_rate {
            car.daily_rate = rate;
        }
        if let Some(status) = changes.status {
            car.status = status;
        }
        if let Some(location) = changes.location {
            car.location = Some(location);
        }
        if let Some(description) = changes.description {
            car.description = Some(description);
        }
        validate_car_fields(
            &car.make,
            &car.model,
            &car.color,
            &car.license_plate,
            car.daily_rate,
            car.location.as_deref(),
            car.description.as_deref(),
        )?;

        car.updated_at = Utc::now();
        self.persist(&mut wal, FleetEvent::CarUpdated { car: car.clone() })?;
        info!("updated car {id} (status {})", car.status);
        Ok(car)
    }

    pub async fn set_status(&self, id: Ulid, status: CarStatus) -> Result<Car, EngineError> {
        self.update(
            id,
            CarChanges {
                status: Some(status),
                ..Default::default()
            },
        )
        .await
    }

    pub fn list_by_status(&self, status: CarStatus) -> Vec<Car> {
        let mut cars: Vec<Car> = self
            .cars
            .iter()
            .filter(|c| c.status == status)
            .map(|c| c.value().clone())
            .collect();
        cars.sort_by_key(|c| c.id);
        cars
    }

    /// Case-insensitive substring match on make, model or location.
    pub fn search(&self, text: &str) -> Vec<Car> {
        let needle = text.trim().to_lowercase();
        let mut cars: Vec<Car> = self
            .cars
            .iter()
            .filter(|c| {
                c.make.to_lowercase().contains(&needle)
                    || c.model.to_lowercase().contains(&needle)
                    || c
                        .location
                        .as_deref()
                        .is_some_and(|l| l.to_lowercase().contains(&needle))
            })
            .map(|c| c.value().clone())
            .collect();
        cars.sort_by_key(|c| c.id);
        cars
    }

    pub async fn appends_since_compact(&self) -> u64 {
        self.wal.lock().await.appends_since_compact()
    }

    /// Rewrite the log as one registration per car carrying its current state.
    pub async fn compact(&self) -> Result<(), EngineError> {
        let mut wal = self.wal.lock().await;
        let events: Vec<FleetEvent> = self
            .list()
            .into_iter()
            .map(|car| FleetEvent::CarRegistered { car })
            .collect();
        Wal::write_compact_file(wal.path(), &events)
            .and_then(|()| wal.swap_compact_file())
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    pub fn len(&self) -> usize {
        self.cars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cars.is_empty()
    }
}

impl Catalog for Fleet {
    fn get(&self, id: &Ulid) -> Option<Car> {
        self.cars.get(id).map(|c| c.value().clone())
    }

    /// All cars, ordered by id.
    fn list(&self) -> Vec<Car> {
        let mut cars: Vec<Car> = self.cars.iter().map(|c| c.value().clone()).collect();
        cars.sort_by_key(|c| c.id);
        cars
    }
}

fn plate_key(plate: &str) -> String {
    plate.trim().to_lowercase()
}

fn validate_car_fields(
    make: &str,
    model: &str,
    color: &str,
    plate: &str,
    daily_rate: Decimal,
    location: Option<&str>,
    description: Option<&str>,
) -> Result<(), EngineError> {
    for (field, value) in [("make", make), ("model", model), ("license_plate", plate)] {
        if value.trim().is_empty() {
            return Err(EngineError::Validation(format!("{field} must not be empty")));
        }
    }
    if make.len() > MAX_NAME_LEN
        || model.len() > MAX_NAME_LEN
        || color.len() > MAX_NAME_LEN
        || location.is_some_and(|l| l.len() > MAX_NAME_LEN)
    {
        return Err(EngineError::LimitExceeded("car field too long"));
    }
    if plate.len() > MAX_PLATE_LEN {
        return Err(EngineError::LimitExceeded("license plate too long"));
    }
    if description.is_some_and(|d| d.len() > MAX_DESCRIPTION_LEN) {
        return Err(EngineError::LimitExceeded("description too long"));
    }
    if daily_rate.is_sign_negative() {
        return Err(EngineError::Validation(
            "daily_rate must not be negative".into(),
        ));
    }
    if daily_rate > Decimal::from(MAX_DAILY_RATE) {
        return Err(EngineError::LimitExceeded("daily_rate too high"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("carbook_test_fleet");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn corolla(plate: &str) -> NewCar {
        NewCar {
            make: "Toyota".into(),
            model: "Corolla".into(),
            year: 2022,
            color: "Blue".into(),
            license_plate: plate.into(),
            daily_rate: Decimal::new(5000, 2),
            status: CarStatus::Available,
            location: Some("Lisbon Airport".into()),
            description: None,
        }
    }

    #[tokio::test]
    async fn register_and_get() {
        let fleet = Fleet::open(&tmp_path("register.wal")).unwrap();
        let car = fleet.register(corolla("AA-01-BB")).await.unwrap();
        assert_eq!(fleet.get(&car.id), Some(car.clone()));
        assert!(fleet.is_bookable(&car));
        assert_eq!(fleet.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_plate_rejected_case_insensitively() {
        let fleet = Fleet::open(&tmp_path("dup_plate.wal")).unwrap();
        fleet.register(corolla("AA-01-BB")).await.unwrap();
        let err = fleet.register(corolla("aa-01-bb ")).await.unwrap_err();
        assert!(matches!(err, EngineError::DuplicateLicensePlate(_)));
        assert_eq!(fleet.len(), 1);
    }

    #[tokio::test]
    async fn invalid_fields_rejected() {
        let fleet = Fleet::open(&tmp_path("invalid.wal")).unwrap();

        let mut car = corolla("X-1");
        car.daily_rate = Decimal::new(-1, 0);
        assert!(matches!(
            fleet.register(car).await.unwrap_err(),
            EngineError::Validation(_)
        ));

        let mut car = corolla("X-2");
        car.make = "  ".into();
        assert!(matches!(
            fleet.register(car).await.unwrap_err(),
            EngineError::Validation(_)
        ));

        let mut car = corolla("X-3");
        car.license_plate = "P".repeat(MAX_PLATE_LEN + 1);
        assert!(matches!(
            fleet.register(car).await.unwrap_err(),
            EngineError::LimitExceeded(_)
        ));

        let mut car = corolla("X-4");
        car.daily_rate = Decimal::MAX;
        assert!(matches!(
            fleet.register(car).await.unwrap_err(),
            EngineError::LimitExceeded(_)
        ));
        assert!(fleet.is_empty());
    }

    #[tokio::test]
    async fn set_status_makes_car_unbookable() {
        let fleet = Fleet::open(&tmp_path("set_status.wal")).unwrap();
        let car = fleet.register(corolla("AB-12-CD")).await.unwrap();
        let car = fleet.set_status(car.id, CarStatus::Maintenance).await.unwrap();
        assert!(!fleet.is_bookable(&car));
        assert_eq!(fleet.list_by_status(CarStatus::Maintenance).len(), 1);
        assert!(fleet.list_by_status(CarStatus::Available).is_empty());
    }

    #[tokio::test]
    async fn update_unknown_car() {
        let fleet = Fleet::open(&tmp_path("update_unknown.wal")).unwrap();
        let err = fleet
            .set_status(Ulid::new(), CarStatus::Unavailable)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::CarNotFound(_)));
    }

    #[tokio::test]
    async fn update_plate_frees_old_one() {
        let fleet = Fleet::open(&tmp_path("update_plate.wal")).unwrap();
        let a = fleet.register(corolla("OLD-1")).await.unwrap();
        let b = fleet.register(corolla("OTHER-2")).await.unwrap();

        let err = fleet
            .update(
                a.id,
                CarChanges {
                    license_plate: Some("other-2".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateLicensePlate(_)));

        fleet
            .update(
                a.id,
                CarChanges {
                    license_plate: Some("NEW-1".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        // The old plate is free again
        fleet.register(corolla("OLD-1")).await.unwrap();
        assert_eq!(fleet.get(&b.id).unwrap().license_plate, "OTHER-2");
    }

    #[tokio::test]
    async fn search_matches_make_model_location() {
        let fleet = Fleet::open(&tmp_path("search.wal")).unwrap();
        fleet.register(corolla("S-1")).await.unwrap();
        let mut civic = corolla("S-2");
        civic.make = "Honda".into();
        civic.model = "Civic".into();
        civic.location = Some("Porto".into());
        fleet.register(civic).await.unwrap();

        assert_eq!(fleet.search("toyota").len(), 1);
        assert_eq!(fleet.search("CIVIC").len(), 1);
        assert_eq!(fleet.search("porto").len(), 1);
        assert!(fleet.search("tesla").is_empty());
    }

    #[tokio::test]
    async fn replay_restores_fleet() {
        let path = tmp_path("replay.wal");
        let id = {
            let fleet = Fleet::open(&path).unwrap();
            let car = fleet.register(corolla("R-1")).await.unwrap();
            fleet
                .update(
                    car.id,
                    CarChanges {
                        daily_rate: Some(Decimal::new(7500, 2)),
                        status: Some(CarStatus::Unavailable),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            car.id
        };

        let fleet = Fleet::open(&path).unwrap();
        let car = fleet.get(&id).unwrap();
        assert_eq!(car.daily_rate, Decimal::new(7500, 2));
        assert_eq!(car.status, CarStatus::Unavailable);
        // Plate index rebuilt from replay
        let err = fleet.register(corolla("r-1")).await.unwrap_err();
        assert!(matches!(err, EngineError::DuplicateLicensePlate(_)));
    }

    #[tokio::test]
    async fn failed_write_registers_nothing() {
        let path = tmp_path("failed_write.wal");
        {
            let fleet = Fleet::open(&path).unwrap();
            fleet.wal.lock().await.fail_next_flush_after(5);
            let err = fleet.register(corolla("F-1")).await.unwrap_err();
            assert!(matches!(err, EngineError::Storage(_)));
            assert!(fleet.is_empty());

            // The plate was never taken
            fleet.register(corolla("F-1")).await.unwrap();
        }

        let fleet = Fleet::open(&path).unwrap();
        assert_eq!(fleet.len(), 1);
    }

    #[tokio::test]
    async fn compact_keeps_current_state_only() {
        let path = tmp_path("compact.wal");
        let id = {
            let fleet = Fleet::open(&path).unwrap();
            let car = fleet.register(corolla("C-1")).await.unwrap();
            for status in [CarStatus::Maintenance, CarStatus::Available, CarStatus::Unavailable] {
                fleet.set_status(car.id, status).await.unwrap();
            }
            assert_eq!(fleet.appends_since_compact().await, 4);
            fleet.compact().await.unwrap();
            assert_eq!(fleet.appends_since_compact().await, 0);
            car.id
        };

        let events: Vec<FleetEvent> = Wal::replay(&path).unwrap();
        assert_eq!(events.len(), 1);
        let fleet = Fleet::open(&path).unwrap();
        assert_eq!(fleet.get(&id).unwrap().status, CarStatus::Unavailable);
    }
}
