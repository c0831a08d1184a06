//! [`Pkcs11Backend`] over a real PKCS#11 module through `cryptoki`.

use super::hsm::{ObjectClass, ObjectTemplate, Pkcs11Backend, Pkcs11Session, SignMechanism, TokenObject, UserType};
use crate::error::{Error, Result};
use cryptoki::context::{CInitializeArgs, Pkcs11};
use cryptoki::mechanism::Mechanism;
use cryptoki::object::{Attribute, AttributeType, ObjectHandle};
use cryptoki::session::Session;
use cryptoki::types::AuthPin;
use indexmap::IndexSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Object handles seen so far. Token object handles stay valid across the
/// sessions of one application, so the registry is shared by all sessions
/// and the engine refers to objects by their index.
type HandleRegistry = Arc<Mutex<IndexSet<ObjectHandle>>>;

/// A loaded and initialized PKCS#11 module. Finalized on drop.
pub struct CryptokiBackend {
    context: Pkcs11,
    handles: HandleRegistry,
}

impl CryptokiBackend {
    /// Load the module at `lib_path` and call `C_Initialize`.
    pub fn new(lib_path: impl AsRef<Path>) -> Result<Self> {
        let lib_path = lib_path.as_ref();
        let context = Pkcs11::new(lib_path)
            .map_err(|e| Error::HsmSession(format!("cannot load PKCS#11 module {}: {}", lib_path.display(), e)))?;
        context
            .initialize(CInitializeArgs::OsThreads)
            .map_err(|e| Error::HsmSession(format!("C_Initialize failed: {}", e)))?;
        log::info!("Loaded PKCS#11 module {}", lib_path.display());
        Ok(Self {
            context,
            handles: HandleRegistry::default(),
        })
    }
}

impl std::fmt::Debug for CryptokiBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptokiBackend").finish_non_exhaustive()
    }
}

impl Pkcs11Backend for CryptokiBackend {
    fn open_session(&self, slot: u64) -> Result<Box<dyn Pkcs11Session>> {
        let slots = self
            .context
            .get_slots_with_token()
            .map_err(|e| Error::HsmSession(format!("C_GetSlotList failed: {}", e)))?;
        let slot = slots
            .into_iter()
            .find(|s| s.id() == slot)
            .ok_or_else(|| Error::HsmSession(format!("no token present in slot {}", slot)))?;
        let session = self
            .context
            .open_rw_session(slot)
            .map_err(|e| Error::HsmSession(format!("C_OpenSession failed: {}", e)))?;
        Ok(Box::new(CryptokiSession {
            session,
            handles: self.handles.clone(),
        }))
    }
}

/// A `cryptoki` session. Closed when dropped.
struct CryptokiSession {
    session: Session,
    handles: HandleRegistry,
}

impl CryptokiSession {
    fn read_object(&mut self, handle: ObjectHandle) -> Result<TokenObject> {
        let attributes = self
            .session
            .get_attributes(handle, &[AttributeType::Label, AttributeType::Id, AttributeType::Value])
            .map_err(|e| Error::HsmSession(format!("C_GetAttributeValue failed: {}", e)))?;
        let (index, _) = self
            .handles
            .lock()
            .map_err(|_| Error::InvariantViolation("object handle registry poisoned".to_string()))?
            .insert_full(handle);

        let mut object = TokenObject {
            handle: index as u64,
            label: None,
            id: None,
            value: None,
        };
        for attribute in attributes {
            match attribute {
                Attribute::Label(label) => object.label = Some(String::from_utf8_lossy(&label).into_owned()),
                Attribute::Id(id) => object.id = Some(id),
                Attribute::Value(value) => object.value = Some(value),
                _ => {},
            }
        }
        Ok(object)
    }
}

impl Pkcs11Session for CryptokiSession {
    fn login(&mut self, user_type: UserType, pin: &str) -> Result<()> {
        let user_type = match user_type {
            UserType::User => cryptoki::session::UserType::User,
            UserType::SecurityOfficer => cryptoki::session::UserType::So,
        };
        self.session
            .login(user_type, Some(&AuthPin::new(pin.to_string())))
            .map_err(|e| Error::HsmSession(format!("C_Login failed: {}", e)))
    }

    fn logout(&mut self) -> Result<()> {
        self.session
            .logout()
            .map_err(|e| Error::HsmSession(format!("C_Logout failed: {}", e)))
    }

    fn find_objects(&mut self, template: &ObjectTemplate) -> Result<Vec<TokenObject>> {
        let class = match template.class {
            ObjectClass::PrivateKey => cryptoki::object::ObjectClass::PRIVATE_KEY,
            ObjectClass::Certificate => cryptoki::object::ObjectClass::CERTIFICATE,
        };
        let mut attributes = vec![Attribute::Class(class)];
        if let Some(label) = &template.label {
            attributes.push(Attribute::Label(label.as_bytes().to_vec()));
        }
        if let Some(id) = &template.id {
            attributes.push(Attribute::Id(id.clone()));
        }
        let handles = self
            .session
            .find_objects(&attributes)
            .map_err(|e| Error::HsmSession(format!("C_FindObjects failed: {}", e)))?;
        handles.into_iter().map(|h| self.read_object(h)).collect()
    }

    fn sign(&mut self, key: u64, mechanism: SignMechanism, data: &[u8]) -> Result<Vec<u8>> {
        let handle = self
            .handles
            .lock()
            .map_err(|_| Error::InvariantViolation("object handle registry poisoned".to_string()))?
            .get_index(key as usize)
            .copied()
            .ok_or_else(|| Error::InvariantViolation(format!("unknown object handle {}", key)))?;
        let mechanism = match mechanism {
            SignMechanism::RsaPkcs => Mechanism::RsaPkcs,
            SignMechanism::Ecdsa => Mechanism::Ecdsa,
        };
        self.session
            .sign(&mechanism, handle, data)
            .map_err(|e| Error::Signing(format!("C_Sign failed: {}", e)))
    }
}
