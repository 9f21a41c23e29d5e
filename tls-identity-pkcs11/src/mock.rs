//! A scripted in-memory token provider for the unit tests.
//!
//! `MockSlot` describes one slot: its token-info snapshots (consumed one
//! per query; the last repeats, and an empty list makes the query fail),
//! the scripted outcomes of successive login attempts, and the objects on
//! the token. The provider records every session and login so tests can
//! assert ordering and cleanup.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};

use pkcs11::errors::Error;
use pkcs11::types::{
    CKA_ID, CKA_SUBJECT, CKA_VALUE, CKC_X_509, CKO_CERTIFICATE, CKO_PRIVATE_KEY,
    CKR_GENERAL_ERROR, CKR_OBJECT_HANDLE_INVALID, CK_ATTRIBUTE_TYPE, CK_CERTIFICATE_TYPE,
    CK_KEY_TYPE, CK_MECHANISM_TYPE, CK_OBJECT_CLASS, CK_OBJECT_HANDLE, CK_SESSION_HANDLE,
    CK_SLOT_ID, CKK_RSA,
};

use crate::provider::{SearchFilter, SlotDescriptor, TokenInfo, TokenOps};

/// Minimal DER that passes certificate import: a three-part SEQUENCE.
pub(crate) fn certificate_der() -> Vec<u8> {
    use simple_asn1::{oid, to_der, ASN1Block};

    let tbs = ASN1Block::Sequence(0, vec![ASN1Block::ObjectIdentifier(0, oid!(2, 5, 4, 3))]);
    let algorithm = ASN1Block::Sequence(
        0,
        vec![ASN1Block::ObjectIdentifier(0, oid!(1, 2, 840, 113549, 1, 1, 11))],
    );
    let signature = ASN1Block::BitString(0, 8, vec![0]);
    to_der(&ASN1Block::Sequence(0, vec![tbs, algorithm, signature])).unwrap()
}

pub(crate) struct MockObject {
    pub handle: CK_OBJECT_HANDLE,
    pub class: CK_OBJECT_CLASS,
    pub certificate_type: Option<CK_CERTIFICATE_TYPE>,
    pub key_type: Option<CK_KEY_TYPE>,
    pub id: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    pub subject: Option<Vec<u8>>,
}

impl MockObject {
    pub fn x509_certificate(handle: CK_OBJECT_HANDLE, id: &[u8], der: Vec<u8>) -> Self {
        MockObject {
            handle,
            class: CKO_CERTIFICATE,
            certificate_type: Some(CKC_X_509),
            key_type: None,
            id: Some(id.to_vec()),
            value: Some(der),
            subject: Some(b"CN=mock".to_vec()),
        }
    }

    pub fn rsa_private_key(handle: CK_OBJECT_HANDLE, id: &[u8]) -> Self {
        MockObject {
            handle,
            class: CKO_PRIVATE_KEY,
            certificate_type: None,
            key_type: Some(CKK_RSA),
            id: Some(id.to_vec()),
            value: None,
            subject: None,
        }
    }

    fn matches(&self, filter: &SearchFilter) -> bool {
        match filter {
            SearchFilter::Class(class) => self.class == *class,
            SearchFilter::CertificateType(t) => self.certificate_type == Some(*t),
            SearchFilter::KeyType(t) => self.key_type == Some(*t),
            SearchFilter::Id(id) => self.id.as_deref() == Some(id.as_slice()),
        }
    }
}

pub(crate) struct MockSlot {
    pub id: CK_SLOT_ID,
    pub token_present: bool,
    pub description: String,
    pub token_infos: Vec<TokenInfo>,
    pub login_results: VecDeque<Result<(), Error>>,
    pub objects: Vec<MockObject>,
}

impl MockSlot {
    pub fn new(id: CK_SLOT_ID) -> Self {
        MockSlot {
            id,
            token_present: true,
            description: format!("mock reader {}", id),
            token_infos: vec![TokenInfo {
                login_required: false,
                protected_auth_path: false,
                pin_count_low: false,
                pin_final_try: false,
                label: format!("mock token {}", id),
            }],
            login_results: VecDeque::new(),
            objects: Vec::new(),
        }
    }
}

#[derive(Default)]
struct ProviderState {
    next_session: CK_SESSION_HANDLE,
    session_slots: HashMap<CK_SESSION_HANDLE, CK_SLOT_ID>,
    opened: Vec<CK_SESSION_HANDLE>,
    closed: Vec<CK_SESSION_HANDLE>,
    token_info_fetches: HashMap<CK_SLOT_ID, usize>,
    login_attempts: Vec<(CK_SLOT_ID, Option<String>)>,
    slot_list_error: Option<Error>,
    sign_init_results: VecDeque<Result<(), Error>>,
    sign_results: VecDeque<Result<Vec<u8>, Error>>,
    sign_init_calls: usize,
}

pub(crate) struct MockProvider {
    slots: RefCell<Vec<MockSlot>>,
    state: RefCell<ProviderState>,
}

impl MockProvider {
    pub fn new(slots: Vec<MockSlot>) -> Self {
        MockProvider {
            slots: RefCell::new(slots),
            state: RefCell::new(ProviderState::default()),
        }
    }

    pub fn fail_slot_list(&self, error: Error) {
        self.state.borrow_mut().slot_list_error = Some(error);
    }

    pub fn push_sign_init_result(&self, result: Result<(), Error>) {
        self.state.borrow_mut().sign_init_results.push_back(result);
    }

    pub fn push_sign_result(&self, result: Result<Vec<u8>, Error>) {
        self.state.borrow_mut().sign_results.push_back(result);
    }

    pub fn opened_sessions(&self) -> Vec<CK_SESSION_HANDLE> {
        self.state.borrow().opened.clone()
    }

    pub fn closed_sessions(&self) -> Vec<CK_SESSION_HANDLE> {
        self.state.borrow().closed.clone()
    }

    pub fn session_slot(&self, session: CK_SESSION_HANDLE) -> CK_SLOT_ID {
        self.state.borrow().session_slots[&session]
    }

    pub fn login_attempts(&self) -> Vec<(CK_SLOT_ID, Option<String>)> {
        self.state.borrow().login_attempts.clone()
    }

    pub fn token_info_fetches(&self, slot: CK_SLOT_ID) -> usize {
        self.state
            .borrow()
            .token_info_fetches
            .get(&slot)
            .copied()
            .unwrap_or(0)
    }

    pub fn sign_init_calls(&self) -> usize {
        self.state.borrow().sign_init_calls
    }

    fn slot_of_session(&self, session: CK_SESSION_HANDLE) -> CK_SLOT_ID {
        self.state
            .borrow()
            .session_slots
            .get(&session)
            .copied()
            .expect("operation on a session that was never opened")
    }
}

impl TokenOps for MockProvider {
    fn slots_with_token(&self) -> Result<Vec<CK_SLOT_ID>, Error> {
        if let Some(error) = self.state.borrow_mut().slot_list_error.take() {
            return Err(error);
        }
        Ok(self.slots.borrow().iter().map(|slot| slot.id).collect())
    }

    fn slot_info(&self, slot: CK_SLOT_ID) -> Result<SlotDescriptor, Error> {
        let slots = self.slots.borrow();
        let slot = slots
            .iter()
            .find(|candidate| candidate.id == slot)
            .expect("slot_info for an unknown slot");
        Ok(SlotDescriptor {
            token_present: slot.token_present,
            description: slot.description.clone(),
        })
    }

    fn token_info(&self, slot: CK_SLOT_ID) -> Result<TokenInfo, Error> {
        let fetches = {
            let mut state = self.state.borrow_mut();
            let counter = state.token_info_fetches.entry(slot).or_insert(0);
            *counter += 1;
            *counter
        };
        let slots = self.slots.borrow();
        let slot = slots
            .iter()
            .find(|candidate| candidate.id == slot)
            .expect("token_info for an unknown slot");
        if slot.token_infos.is_empty() {
            return Err(Error::Pkcs11(CKR_GENERAL_ERROR));
        }
        let index = (fetches - 1).min(slot.token_infos.len() - 1);
        Ok(slot.token_infos[index].clone())
    }

    fn open_session(&self, slot: CK_SLOT_ID) -> Result<CK_SESSION_HANDLE, Error> {
        let mut state = self.state.borrow_mut();
        state.next_session += 1;
        let session = state.next_session;
        state.session_slots.insert(session, slot);
        state.opened.push(session);
        Ok(session)
    }

    fn close_session(&self, session: CK_SESSION_HANDLE) {
        self.state.borrow_mut().closed.push(session);
    }

    fn login_user(&self, session: CK_SESSION_HANDLE, pin: Option<&str>) -> Result<(), Error> {
        let slot_id = self.slot_of_session(session);
        self.state
            .borrow_mut()
            .login_attempts
            .push((slot_id, pin.map(str::to_string)));
        self.slots
            .borrow_mut()
            .iter_mut()
            .find(|candidate| candidate.id == slot_id)
            .expect("login on an unknown slot")
            .login_results
            .pop_front()
            .expect("login attempt without a scripted result")
    }

    fn find_objects(
        &self,
        session: CK_SESSION_HANDLE,
        filters: &[SearchFilter],
    ) -> Result<Vec<CK_OBJECT_HANDLE>, Error> {
        let slot_id = self.slot_of_session(session);
        let slots = self.slots.borrow();
        let slot = slots
            .iter()
            .find(|candidate| candidate.id == slot_id)
            .expect("search on an unknown slot");
        Ok(slot
            .objects
            .iter()
            .filter(|object| filters.iter().all(|filter| object.matches(filter)))
            .map(|object| object.handle)
            .collect())
    }

    fn read_attribute(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
        attribute: CK_ATTRIBUTE_TYPE,
    ) -> Result<Vec<u8>, Error> {
        let slot_id = self.slot_of_session(session);
        let slots = self.slots.borrow();
        let slot = slots
            .iter()
            .find(|candidate| candidate.id == slot_id)
            .expect("attribute read on an unknown slot");
        let object = slot
            .objects
            .iter()
            .find(|candidate| candidate.handle == object)
            .ok_or(Error::Pkcs11(CKR_OBJECT_HANDLE_INVALID))?;
        let value = match attribute {
            CKA_VALUE => object.value.clone(),
            CKA_ID => object.id.clone(),
            CKA_SUBJECT => object.subject.clone(),
            _ => None,
        };
        value.ok_or(Error::UnavailableInformation)
    }

    fn sign_init(
        &self,
        _session: CK_SESSION_HANDLE,
        _mechanism: CK_MECHANISM_TYPE,
        _key: CK_OBJECT_HANDLE,
    ) -> Result<(), Error> {
        let mut state = self.state.borrow_mut();
        state.sign_init_calls += 1;
        state.sign_init_results.pop_front().unwrap_or(Ok(()))
    }

    fn sign(&self, _session: CK_SESSION_HANDLE, _digest: &[u8]) -> Result<Vec<u8>, Error> {
        self.state
            .borrow_mut()
            .sign_results
            .pop_front()
            .expect("sign call without a scripted result")
    }
}
