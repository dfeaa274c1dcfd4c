use crate::{
    clock::ClockValue,
    error::Error,
    field::Field,
    schema::{FieldType, StructType},
    types::LogLevel,
};
use fxhash::FxHashMap;
use internment::Intern;
use std::sync::Arc;

/// The class of an event record: its numeric id within the stream
/// class, name, optional log level and EMF URI, and the context and
/// payload field types.
#[derive(Clone, Debug)]
pub struct EventClass {
    pub(crate) frozen: bool,
    pub(crate) id: Option<u64>,
    pub(crate) name: Intern<String>,
    pub(crate) log_level: Option<LogLevel>,
    pub(crate) emf_uri: Option<String>,
    pub(crate) context_type: Option<Arc<FieldType>>,
    pub(crate) payload_type: Option<Arc<FieldType>>,
}

impl EventClass {
    pub fn new<S: Into<String>>(name: S) -> Result<Self, Error> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::invalid("event class name is empty"));
        }
        Ok(Self {
            frozen: false,
            id: None,
            name: Intern::new(name),
            log_level: None,
            emf_uri: None,
            context_type: None,
            payload_type: None,
        })
    }

    pub fn name(&self) -> Intern<String> {
        self.name
    }

    /// The id assigned when this class was added to a stream class.
    pub fn id(&self) -> Option<u64> {
        self.id
    }

    pub fn log_level(&self) -> Option<LogLevel> {
        self.log_level
    }

    pub fn emf_uri(&self) -> Option<&str> {
        self.emf_uri.as_deref()
    }

    pub fn context_type(&self) -> Option<&Arc<FieldType>> {
        self.context_type.as_ref()
    }

    pub fn payload_type(&self) -> Option<&Arc<FieldType>> {
        self.payload_type.as_ref()
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    fn check_frozen(&self) -> Result<(), Error> {
        if self.frozen {
            Err(Error::Frozen("event class"))
        } else {
            Ok(())
        }
    }

    pub fn set_log_level(&mut self, log_level: LogLevel) -> Result<(), Error> {
        self.check_frozen()?;
        self.log_level = Some(log_level);
        Ok(())
    }

    pub fn set_emf_uri<S: Into<String>>(&mut self, emf_uri: S) -> Result<(), Error> {
        self.check_frozen()?;
        self.emf_uri = Some(emf_uri.into());
        Ok(())
    }

    pub fn set_context_type(&mut self, ty: FieldType) -> Result<(), Error> {
        self.check_frozen()?;
        self.context_type = Some(Arc::new(ty));
        Ok(())
    }

    pub fn set_payload_type(&mut self, ty: FieldType) -> Result<(), Error> {
        self.check_frozen()?;
        self.payload_type = Some(Arc::new(ty));
        Ok(())
    }

    /// Appends a field to the payload structure, creating an empty
    /// payload structure on first use.
    pub fn add_field<S: Into<String>>(&mut self, name: S, ty: FieldType) -> Result<(), Error> {
        self.check_frozen()?;
        let payload = self
            .payload_type
            .get_or_insert_with(|| Arc::new(FieldType::Struct(StructType::new())));
        match Arc::make_mut(payload) {
            FieldType::Struct(st) => st.add_field(name, ty),
            _ => Err(Error::invalid(
                "event class payload type is not a structure",
            )),
        }
    }
}

/// An event record being built: one field per populated scope, owned
/// by the caller until appended to a stream.
#[derive(Clone, Debug)]
pub struct Event {
    class: Arc<EventClass>,
    header: Option<Field>,
    stream_event_context: Option<Field>,
    context: Option<Field>,
    payload: Option<Field>,
    clock_values: FxHashMap<Intern<String>, ClockValue>,
}

impl Event {
    pub(crate) fn new(
        class: Arc<EventClass>,
        event_header_type: Option<Arc<FieldType>>,
        stream_event_context_type: Option<Arc<FieldType>>,
    ) -> Self {
        let header = event_header_type.map(Field::from_arc);
        let stream_event_context = stream_event_context_type.map(Field::from_arc);
        let context = class.context_type.clone().map(Field::from_arc);
        let payload = class.payload_type.clone().map(Field::from_arc);
        Self {
            class,
            header,
            stream_event_context,
            context,
            payload,
            clock_values: FxHashMap::default(),
        }
    }

    pub fn event_class(&self) -> &Arc<EventClass> {
        &self.class
    }

    pub fn header(&self) -> Option<&Field> {
        self.header.as_ref()
    }

    pub fn header_mut(&mut self) -> Option<&mut Field> {
        self.header.as_mut()
    }

    pub fn stream_event_context(&self) -> Option<&Field> {
        self.stream_event_context.as_ref()
    }

    pub fn stream_event_context_mut(&mut self) -> Option<&mut Field> {
        self.stream_event_context.as_mut()
    }

    pub fn context(&self) -> Option<&Field> {
        self.context.as_ref()
    }

    pub fn context_mut(&mut self) -> Option<&mut Field> {
        self.context.as_mut()
    }

    pub fn payload(&self) -> Option<&Field> {
        self.payload.as_ref()
    }

    pub fn payload_mut(&mut self) -> Option<&mut Field> {
        self.payload.as_mut()
    }

    /// Convenience lookup of a named payload field (structure payloads
    /// only); the child is created on first access.
    pub fn payload_field(&mut self, name: &str) -> Result<&mut Field, Error> {
        self.payload
            .as_mut()
            .ok_or_else(|| Error::invalid("event class has no payload type"))?
            .as_struct_mut()
            .ok_or_else(|| Error::invalid("event payload is not a structure"))?
            .field_by_name(name)
    }

    pub fn context_field(&mut self, name: &str) -> Result<&mut Field, Error> {
        self.context
            .as_mut()
            .ok_or_else(|| Error::invalid("event class has no context type"))?
            .as_struct_mut()
            .ok_or_else(|| Error::invalid("event context is not a structure"))?
            .field_by_name(name)
    }

    pub fn set_clock_value(&mut self, value: ClockValue) {
        self.clock_values.insert(value.clock_name(), value);
    }

    pub fn clock_value(&self, clock_name: &str) -> Option<&ClockValue> {
        self.clock_values.get(&Intern::new(clock_name.to_owned()))
    }

    /// Validates every populated scope field.
    pub fn validate(&self) -> Result<(), Error> {
        for (what, field) in [
            ("event header", self.header.as_ref()),
            ("stream event context", self.stream_event_context.as_ref()),
            ("event context", self.context.as_ref()),
            ("event payload", self.payload.as_ref()),
        ] {
            if let Some(field) = field {
                field
                    .validate()
                    .map_err(|e| Error::validation(format!("in {what}: {e}")))?;
            }
        }
        Ok(())
    }

    pub(crate) fn freeze(&mut self) {
        for field in [
            self.header.as_mut(),
            self.stream_event_context.as_mut(),
            self.context.as_mut(),
            self.payload.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            field.freeze();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::schema::IntegerType;

    #[test]
    fn payload_fields_accumulate_into_a_structure() {
        let mut ec = EventClass::new("alloc").unwrap();
        ec.add_field("size", IntegerType::new(64).unwrap().into()).unwrap();
        ec.add_field("addr", IntegerType::new(64).unwrap().into()).unwrap();

        let payload = ec.payload_type().unwrap();
        assert_eq!(payload.field_count(), 2);
        assert_eq!(payload.field_index("addr"), Some(1));
    }

    #[test]
    fn frozen_event_class_rejects_mutation() {
        let mut ec = EventClass::new("alloc").unwrap();
        ec.frozen = true;
        assert!(matches!(
            ec.add_field("x", IntegerType::new(8).unwrap().into()),
            Err(Error::Frozen(_))
        ));
        assert!(matches!(
            ec.set_log_level(LogLevel::Info),
            Err(Error::Frozen(_))
        ));
    }
}
